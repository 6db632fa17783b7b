//! The three binaries touch `/var/log/*.status` and a working directory
//! that's normally owned by a system account; spec.md §6 requires they
//! refuse to start otherwise (exit code 2).

/// `true` iff the effective user id is 0.
pub fn running_as_root() -> bool {
    // SAFETY: `geteuid` takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_a_boolean_without_panicking() {
        let _ = running_as_root();
    }
}
