//! Request correlation tokens.
//!
//! Every asynchronous request (search, folder browse, upload negotiation,
//! indirect connection) carries a token that the remote side echoes back.
//! Each request class has its own 31-bit wrapping sequence so that a burst of
//! searches never collides with outstanding upload tokens.

use crate::constants::MAX_TOKEN;

/// The request class a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenClass {
    /// FileSearch, UserSearch and RoomSearch requests.
    Search,
    /// FolderContentsRequest.
    FolderContents,
    /// Indirect connection requests (ConnectToPeer) and file connection tokens.
    Transfer,
    /// TransferRequest messages for uploads.
    Upload,
}

/// A single 31-bit wrapping counter.
#[derive(Debug, Clone, Default)]
pub struct TokenSequence {
    last: u32,
}

impl TokenSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the sequence after `last`, for example after restoring state.
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: last & MAX_TOKEN,
        }
    }

    /// Returns the next token. Zero is skipped, as several clients treat it as
    /// "no token".
    pub fn next_token(&mut self) -> u32 {
        self.last = if self.last >= MAX_TOKEN {
            1
        } else {
            self.last + 1
        };
        self.last
    }

    pub fn last(&self) -> u32 {
        self.last
    }
}

/// One token sequence per [`TokenClass`].
#[derive(Debug, Clone, Default)]
pub struct TokenGenerator {
    search: TokenSequence,
    folder_contents: TokenSequence,
    transfer: TokenSequence,
    upload: TokenSequence,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, class: TokenClass) -> u32 {
        self.sequence_mut(class).next_token()
    }

    fn sequence_mut(&mut self, class: TokenClass) -> &mut TokenSequence {
        match class {
            TokenClass::Search => &mut self.search,
            TokenClass::FolderContents => &mut self.folder_contents,
            TokenClass::Transfer => &mut self.transfer,
            TokenClass::Upload => &mut self.upload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_starts_at_one() {
        let mut seq = TokenSequence::new();
        assert_eq!(seq.next_token(), 1);
        assert_eq!(seq.next_token(), 2);
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let mut seq = TokenSequence::starting_after(MAX_TOKEN - 1);
        assert_eq!(seq.next_token(), MAX_TOKEN);
        assert_eq!(seq.next_token(), 1);
    }

    #[test]
    fn test_classes_are_independent() {
        let mut tokens = TokenGenerator::new();
        assert_eq!(tokens.next(TokenClass::Search), 1);
        assert_eq!(tokens.next(TokenClass::Search), 2);
        assert_eq!(tokens.next(TokenClass::Upload), 1);
        assert_eq!(tokens.next(TokenClass::FolderContents), 1);
        assert_eq!(tokens.next(TokenClass::Transfer), 1);
        assert_eq!(tokens.next(TokenClass::Search), 3);
    }
}
