use std::{hash::Hash, sync::Arc};

use crate::Data;

/// A file published by a sender.
///
/// `full_path` identifies the file within its transfer set and must be
/// unique there. It conventionally starts with `/` (e.g. `/photos/a.jpg`).
#[derive(Clone)]
pub struct File {
    pub full_path: String,
    pub mime_type: String,
    pub data: Arc<dyn Data>,
}

impl File {
    pub fn new(
        full_path: impl Into<String>,
        mime_type: impl Into<String>,
        data: Arc<dyn Data>,
    ) -> Self {
        Self {
            full_path: full_path.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("full_path", &self.full_path)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Hash for File {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_path.hash(state);
    }
}

impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.full_path == other.full_path
    }
}

impl Eq for File {}
