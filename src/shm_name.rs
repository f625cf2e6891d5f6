// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming of the OS objects that back a channel.
//
// A channel called `video` maps to the data segment `SS_SEG__video` and to
// the waiter objects derived from `SS_WAIT__video`. POSIX names get a
// leading '/' and, on platforms with short limits, are shortened with a
// stable FNV-1a hash.

/// Prefix of the data segment of a channel.
const SEGMENT_PREFIX: &str = "SS_SEG__";
/// Prefix of the condition/mutex pair used for blocking waits.
const WAITER_PREFIX: &str = "SS_WAIT__";

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names. 0 disables shortening.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Name of the shared memory segment holding the channel `channel`.
pub fn segment_name(channel: &str) -> String {
    format!("{SEGMENT_PREFIX}{channel}")
}

/// Base name of the waiter used by blocking reads on `channel`.
pub fn waiter_name(channel: &str) -> String {
    format!("{WAITER_PREFIX}{channel}")
}

/// Produce a POSIX shm-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names longer than the limit become
/// `/<prefix>_<16 hex digits of FNV-1a>`, keeping as much of the original
/// name as fits for debuggability.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    shorten(result, SHM_NAME_MAX)
}

fn shorten(full: String, max: usize) -> String {
    if max == 0 || full.len() <= max {
        return full;
    }

    // '_' plus 16 hex digits
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = max.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = fnv1a_64(full.as_bytes());
    let body = &full[1..];
    let mut take = prefix_len.min(body.len());
    while !body.is_char_boundary(take) {
        take -= 1;
    }

    let mut shortened = String::with_capacity(max);
    shortened.push('/');
    shortened.push_str(&body[..take]);
    shortened.push_str(&format!("_{hash:016x}"));
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_of_empty_input_is_offset_basis() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn prepends_slash() {
        let name = make_shm_name("foo");
        assert!(name.starts_with('/'));
        assert!(name.contains("foo"));
    }

    #[test]
    fn keeps_existing_slash() {
        let name = make_shm_name("/bar");
        assert_eq!(&name[..4], "/bar");
    }

    #[test]
    fn long_names_are_hashed_to_the_limit() {
        let long = format!("/{}", "x".repeat(80));
        let short = shorten(long.clone(), 31);
        assert_eq!(short.len(), 31);
        assert!(short.starts_with("/xxxxxxxxxxxxx_"));
        assert_eq!(short, shorten(long, 31));
    }

    #[test]
    fn channel_objects_do_not_collide() {
        assert_ne!(segment_name("video"), waiter_name("video"));
        assert!(segment_name("video").ends_with("video"));
    }
}
