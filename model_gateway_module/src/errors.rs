#[derive(Debug, thiserror::Error)]
pub enum ModelGatewayError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid service response: {0}")]
    InvalidResponse(String),
}
