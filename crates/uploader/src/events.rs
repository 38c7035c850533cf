/// Progress notifications emitted by [`UploadClient`](crate::UploadClient).
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started {
        file_name: String,
        size: u64,
        total_chunks: u32,
    },
    /// A chunk was acknowledged.
    Progress {
        file_name: String,
        acknowledged: u32,
        total_chunks: u32,
    },
    Completed {
        file_name: String,
        hash: String,
    },
    Failed {
        file_name: String,
        error: String,
    },
    Cancelled {
        file_name: String,
    },
}

impl UploadEvent {
    /// Fraction of chunks acknowledged, for progress events.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            UploadEvent::Progress {
                acknowledged,
                total_chunks,
                ..
            } if *total_chunks > 0 => Some(f64::from(*acknowledged) / f64::from(*total_chunks)),
            _ => None,
        }
    }
}
