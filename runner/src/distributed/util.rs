use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use tracing::error;

/// name of this host, used to tell the workers of different machines apart in logs
pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname: {error}");

        "unknown-host".to_owned()
    }
});

pub fn worker_name(id: usize) -> String {
    format!("worker{id}")
}

/// label of a worker loop in logs, `<hostname>/worker<id>`
pub fn worker_label(id: usize) -> String {
    format!("{}/{}", HOSTNAME.as_str(), worker_name(id))
}

/// every worker loop writes into its own directory below the shared output directory
pub fn worker_output_dir(base: &Path, id: usize) -> PathBuf {
    base.join(worker_name(id))
}
