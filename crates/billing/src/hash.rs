use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Duplicate-detection fingerprint for an uploaded timesheet image: the
/// SHA-256 of its bytes as 64 lowercase hex characters.
pub fn image_fingerprint(image: &[u8]) -> String {
    Sha256::digest(image).iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scan_has_the_standard_digest() {
        assert_eq!(
            image_fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rescanned_page_is_recognised() {
        let scan = image_fingerprint(b"timesheet scan");
        assert_eq!(scan.len(), 64);
        assert!(scan.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(scan, image_fingerprint(b"timesheet scan"));
        assert_ne!(scan, image_fingerprint(b"timesheet scan 2"));
    }
}
