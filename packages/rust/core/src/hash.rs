//! Content hashing for change detection.

use sha2::{Digest, Sha256};

/// SHA-256 over the text lines, then the image URLs, each terminated by
/// `\n`. Returned as lowercase hex.
///
/// Lines are not escaped, so `["a\nb"]` and `["a", "b"]` hash equal.
pub fn content_hash<T, I>(text: &[T], images: &[I]) -> String
where
    T: AsRef<str>,
    I: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for line in text {
        hasher.update(line.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    for url in images {
        hasher.update(url.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn known_digest() {
        assert_eq!(
            content_hash(&["hello world"], NONE),
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
    }

    #[test]
    fn empty_input_is_empty_digest() {
        assert_eq!(
            content_hash(NONE, NONE),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn deterministic() {
        let text = vec!["Sale".to_string(), "Buy now".to_string()];
        let images = vec!["https://a.example/x.png".to_string()];
        assert_eq!(content_hash(&text, &images), content_hash(&text, &images));
    }

    #[test]
    fn order_and_content_matter() {
        let a = content_hash(&["one", "two"], NONE);
        let b = content_hash(&["two", "one"], NONE);
        let c = content_hash(&["one", "two", "three"], NONE);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn images_participate() {
        let without = content_hash(&["page"], NONE);
        let with = content_hash(&["page"], &["https://a.example/x.png"]);
        assert_ne!(without, with);
    }

    #[test]
    fn line_boundaries_are_not_escaped() {
        assert_eq!(content_hash(&["a\nb"], NONE), content_hash(&["a", "b"], NONE));
    }
}
