use super::util::{worker_label, worker_output_dir, HOSTNAME};
use std::path::{Path, PathBuf};

#[test]
pub fn label_contains_hostname_and_worker() {
    let label = worker_label(3);

    assert!(label.starts_with(HOSTNAME.as_str()));
    assert!(label.ends_with("/worker3"));
}

#[test]
pub fn output_dir_per_worker() {
    assert_eq!(
        worker_output_dir(Path::new("/scratch/out"), 0),
        PathBuf::from("/scratch/out/worker0")
    );
    assert_ne!(
        worker_output_dir(Path::new("out"), 1),
        worker_output_dir(Path::new("out"), 2)
    );
}
