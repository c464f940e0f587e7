use thiserror::Error;

/// Statuses for which a retry can never succeed.
const TERMINAL_STATUSES: [u16; 4] = [400, 401, 403, 404];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[error("store rejected request ({status}): {detail}")]
    Terminal { status: u16, detail: String },
    #[error("store returned retryable status {status}")]
    RetryableStatus { status: u16 },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store reported success but returned no row")]
    EmptyResponse,
    #[error("upload failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetryableStatus { .. } | Self::Transport(_) | Self::Exhausted { .. }
        )
    }

    pub(crate) fn is_terminal_status(status: u16) -> bool {
        TERMINAL_STATUSES.contains(&status)
    }
}
