use std::ffi::CStr;

/// Length of the kernel's `task_struct::comm`, including the trailing NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Utility functions for working with combined tgidpid values.
///
/// In the Linux kernel, `bpf_get_current_pid_tgid()` returns a u64 where:
/// - Lower 32 bits: TID (Thread ID)
/// - Upper 32 bits: TGID (Thread Group ID, which is the Process ID)
///
///   Extract TID (Thread ID) from combined tgidpid value.
///
/// # Examples
///
/// ```
/// use tmt::utils::tid_from_tgidpid;
///
/// let tgidpid: u64 = 0x0000_1234_0000_5678;
/// assert_eq!(tid_from_tgidpid(tgidpid), 0x5678);
/// ```
#[inline(always)]
pub const fn tid_from_tgidpid(tgidpid: u64) -> u32 {
    (tgidpid & 0xFFFFFFFF) as u32
}

/// Extract the TGID (user-visible process id) from combined tgidpid value.
///
/// # Examples
///
/// ```
/// use tmt::utils::tgid_from_tgidpid;
///
/// let tgidpid: u64 = 0x0000_1234_0000_5678;
/// assert_eq!(tgid_from_tgidpid(tgidpid), 0x1234);
/// ```
#[inline(always)]
pub const fn tgid_from_tgidpid(tgidpid: u64) -> u32 {
    (tgidpid >> 32) as u32
}

/// Decode a fixed-width, possibly unterminated `comm` buffer.
///
/// The kernel truncates names to 15 bytes plus NUL; a buffer without a NUL is
/// taken whole.
pub fn comm_to_string(comm: &[u8]) -> String {
    match CStr::from_bytes_until_nul(comm) {
        Ok(cstr) => cstr.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(comm).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_extraction() {
        let tgidpid: u64 = 0x0000_1234_0000_5678;
        assert_eq!(tid_from_tgidpid(tgidpid), 0x5678);
    }

    #[test]
    fn test_tgid_extraction() {
        let tgidpid: u64 = 0x0000_1234_0000_5678;
        assert_eq!(tgid_from_tgidpid(tgidpid), 0x1234);
    }

    #[test]
    fn test_same_tid_tgid() {
        // Main thread has same TID and TGID
        let tgidpid: u64 = 0x0000_1000_0000_1000;
        assert_eq!(tid_from_tgidpid(tgidpid), 0x1000);
        assert_eq!(tgid_from_tgidpid(tgidpid), 0x1000);
    }

    #[test]
    fn test_comm_with_nul() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"bash");
        assert_eq!(comm_to_string(&comm), "bash");
    }

    #[test]
    fn test_comm_truncated_without_nul() {
        let comm = *b"0123456789abcdef";
        assert_eq!(comm_to_string(&comm), "0123456789abcdef");
    }
}
