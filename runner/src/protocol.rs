//! Line based wire format spoken between coordinator and workers
//!
//! Every exchange is a single connection carrying one request and at most one reply.
//! A message is a JSON object terminated by `\n` whose `signal` field holds the integer
//! discriminant, all other fields are typed and escaped by the serializer.

use crate::catalog::{JobDescriptor, JobIdent, RequestIdent};
use serde::{Deserialize, Serialize};
use serde_repr::*;
use std::{
    io::{BufRead, Read, Write},
    path::{Component, Path},
};
use thiserror::Error;

/// upper bound for a single inbound line, anything larger is rejected
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed while exchanging a message")]
    Io(#[from] std::io::Error),
    #[error("Connection closed before a message was received")]
    Empty,
    #[error("Message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Signal {signal:?} requires the field '{field}'")]
    MissingField { signal: Signal, field: &'static str },
    #[error("Invalid job reference {0:?}")]
    InvalidReference(String),
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum Signal {
    RequestJob = 1,
    SubmitFinished = 2,
    Sleep = 3,
    Execute = 4,
}

/// A single dispatch handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub request: RequestIdent,
    pub job: JobIdent,
    pub descriptor: JobDescriptor,
    /// estimated remaining seconds (mean job duration x remaining jobs), if known
    pub eta_secs: Option<f64>,
    /// estimated remaining seconds (elapsed / done jobs x remaining jobs), if known
    pub eta_throughput_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestJob,
    SubmitFinished {
        request: RequestIdent,
        job: JobIdent,
    },
    Sleep,
    Execute(Assignment),
}

impl Message {
    pub fn signal(&self) -> Signal {
        match self {
            Self::RequestJob => Signal::RequestJob,
            Self::SubmitFinished { .. } => Signal::SubmitFinished,
            Self::Sleep => Signal::Sleep,
            Self::Execute(_) => Signal::Execute,
        }
    }
}

// flat representation on the wire
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct Envelope {
    signal: Signal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<RequestIdent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job: Option<JobIdent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    descriptor: Option<JobDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eta_throughput_secs: Option<f64>,
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        let mut envelope = Envelope {
            signal: message.signal(),
            request: None,
            job: None,
            descriptor: None,
            eta_secs: None,
            eta_throughput_secs: None,
        };

        match message {
            Message::RequestJob | Message::Sleep => {}
            Message::SubmitFinished { request, job } => {
                envelope.request = Some(request);
                envelope.job = Some(job);
            }
            Message::Execute(assignment) => {
                envelope.request = Some(assignment.request);
                envelope.job = Some(assignment.job);
                envelope.descriptor = Some(assignment.descriptor);
                envelope.eta_secs = assignment.eta_secs;
                envelope.eta_throughput_secs = assignment.eta_throughput_secs;
            }
        }

        envelope
    }
}

impl TryFrom<Envelope> for Message {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let signal = envelope.signal;
        let missing = |field| ProtocolError::MissingField { signal, field };

        match signal {
            Signal::RequestJob => Ok(Self::RequestJob),
            Signal::Sleep => Ok(Self::Sleep),
            Signal::SubmitFinished => Ok(Self::SubmitFinished {
                request: envelope.request.ok_or_else(|| missing("request"))?,
                job: envelope.job.ok_or_else(|| missing("job"))?,
            }),
            Signal::Execute => {
                let descriptor = envelope.descriptor.ok_or_else(|| missing("descriptor"))?;

                for reference in [
                    &descriptor.instance,
                    &descriptor.setting,
                    &descriptor.config,
                ] {
                    check_reference(reference)?;
                }

                Ok(Self::Execute(Assignment {
                    request: envelope.request.ok_or_else(|| missing("request"))?,
                    job: envelope.job.ok_or_else(|| missing("job"))?,
                    descriptor,
                    eta_secs: envelope.eta_secs,
                    eta_throughput_secs: envelope.eta_throughput_secs,
                }))
            }
        }
    }
}

/// a reference has to stay inside the directory it is resolved against
fn check_reference(reference: &str) -> Result<(), ProtocolError> {
    let path = Path::new(reference);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));

    if reference.is_empty() || reference.contains('\0') || escapes {
        Err(ProtocolError::InvalidReference(reference.to_owned()))
    } else {
        Ok(())
    }
}

/// Read exactly one message, terminated by a line break or the end of the stream
pub fn read_message<R: BufRead>(reader: R) -> Result<Message, ProtocolError> {
    let mut line = String::new();
    reader.take(MAX_MESSAGE_BYTES + 1).read_line(&mut line)?;

    if line.len() as u64 > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let envelope: Envelope = serde_json::from_str(trimmed)?;

    Message::try_from(envelope)
}

/// Write one message followed by a line break
pub fn write_message<W: Write>(mut writer: W, message: &Message) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(&Envelope::from(message.clone()))?;
    line.push(b'\n');

    writer.write_all(&line)?;
    writer.flush()?;

    Ok(())
}
