//! One-line status file per spec.md §6:
//! `/var/log/<role>-<script_id>.status` — "Container: …, Size: …/…, Next: …"

use std::{
    io::Write,
    path::PathBuf,
};

pub fn status_path(role: &str, script_id: &str) -> PathBuf {
    PathBuf::from(format!("/var/log/{role}-{script_id}.status"))
}

pub fn write_status(
    role: &str,
    script_id: &str,
    container: &str,
    current_size: u64,
    archive_size: u64,
    next: &str,
) -> std::io::Result<()> {
    let path = status_path(role, script_id);
    let mut file = std::fs::File::create(path)?;
    writeln!(
        file,
        "Container: {container}, Size: {current_size}/{archive_size}, Next: {next}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_path_matches_spec_layout() {
        assert_eq!(
            status_path("pack", "worker-1"),
            PathBuf::from("/var/log/pack-worker-1.status")
        );
    }
}
