use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A quoted character range of an earlier message.
///
/// `start` and `end` are character (not byte) offsets into the message text as it was
/// persisted. Messages are append-only, so offsets stay valid for the life of the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReference {
    pub source_block_id: Uuid,
    pub source_message_id: Uuid,
    pub start: usize,
    pub end: usize,
}

impl ChatReference {
    pub fn new(source_block_id: Uuid, source_message_id: Uuid, start: usize, end: usize) -> Self {
        ChatReference {
            source_block_id,
            source_message_id,
            start,
            end,
        }
    }

    /// Slice the referenced range out of `text`, or `None` if the range does not fit.
    pub fn resolve<'a>(&self, text: &'a str) -> Option<&'a str> {
        if self.start >= self.end {
            return None;
        }
        let mut boundaries = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()));
        let start = boundaries.nth(self.start)?;
        let end = boundaries.nth(self.end - self.start - 1)?;
        Some(&text[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(start: usize, end: usize) -> ChatReference {
        ChatReference::new(Uuid::new_v4(), Uuid::new_v4(), start, end)
    }

    #[test]
    fn test_resolve_ranges() {
        let text = "The quick brown fox";
        assert_eq!(reference(4, 9).resolve(text), Some("quick"));
        assert_eq!(reference(0, 19).resolve(text), Some(text));
        assert_eq!(reference(16, 19).resolve(text), Some("fox"));
    }

    #[test]
    fn test_resolve_uses_char_offsets() {
        let text = "naïve café";
        assert_eq!(reference(0, 5).resolve(text), Some("naïve"));
        assert_eq!(reference(6, 10).resolve(text), Some("café"));
    }

    #[test]
    fn test_resolve_out_of_range() {
        let text = "short";
        assert_eq!(reference(2, 6).resolve(text), None);
        assert_eq!(reference(3, 3).resolve(text), None);
        assert_eq!(reference(4, 2).resolve(text), None);
    }
}
