pub mod server;
pub mod util;
pub mod worker;

#[cfg(test)]
mod util_test;

/*
 * Pull based work distribution:
 * 1. The coordinator builds the job catalog once and keeps all job state in memory
 * 2. Workers connect for every single exchange: request a job, run it, report it
 * 3. Workers are never trusted to report failures, stalled jobs are reclaimed by the
 *    timeout monitor and handed out again (at-least-once execution)
 * 4. The coordinator stops listening once no job is left to dispatch or waiting for a
 *    result, workers take the refused connection as the signal to terminate
 */
