use serde::{Deserialize, Serialize};

/// What a [`Handler`](super::Handler) receives for every delivery: the raw payload, untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Output {
    pub data: Vec<u8>,
}

impl From<Vec<u8>> for Output {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}
