use thiserror::Error;

#[derive(Error, Debug)]
pub enum RummageCliError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("{0}")]
    Rummage(#[from] rummage::Error),
}

pub type Result<T> = std::result::Result<T, RummageCliError>;
