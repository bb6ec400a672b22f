use thiserror::Error;

pub type Result<T> = std::result::Result<T, RiskError>;

#[derive(Error, Debug)]
pub enum RiskError {
    #[error("schema problem with [{}]: {message}", fields.join(", "))]
    Schema { fields: Vec<String>, message: String },

    #[error("not enough data: {message}")]
    InsufficientData { message: String },

    #[error("fit failed: {message}")]
    Fit { message: String },

    #[error("degenerate split: {message}")]
    DegenerateSplit { message: String },

    #[error("attribution failed: {message}")]
    Attribution { message: String },

    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("can't parse {value:?} for field {field}")]
    Parse { field: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl RiskError {
    pub fn schema<I, S>(fields: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Schema {
            fields: fields.into_iter().map(Into::into).collect(),
            message: message.into(),
        }
    }

    pub fn insufficient_data(message: impl Into<String>) -> Self {
        Self::InsufficientData { message: message.into() }
    }

    pub fn fit(message: impl Into<String>) -> Self {
        Self::Fit { message: message.into() }
    }

    pub fn degenerate_split(message: impl Into<String>) -> Self {
        Self::DegenerateSplit { message: message.into() }
    }

    pub fn attribution(message: impl Into<String>) -> Self {
        Self::Attribution { message: message.into() }
    }

    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl ToString) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.to_string(),
        }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn parse(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Parse {
            field: field.into(),
            value: value.into(),
        }
    }

    /// field names carried by a schema error (empty for other kinds)
    pub fn fields(&self) -> &[String] {
        match self {
            Self::Schema { fields, .. } => fields,
            _ => &[],
        }
    }
}
