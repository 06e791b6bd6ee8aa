/// Structured error handling for DcaBot
///
/// Groups failures by subsystem so callers can react differently to exchange
/// conditions (retryable, per-venue) versus database or configuration faults
/// (fatal or operator-facing).
use crate::exchanges::ExchangeError;

// =============================================================================
// MAIN ERROR TYPE
// =============================================================================

#[derive(Debug)]
pub enum DcaBotError {
    // Exchange adapter contract errors
    Exchange(ExchangeError),

    // Network connectivity errors (market data, non-adapter HTTP)
    Network(NetworkError),

    // SQLite persistence errors
    Database(DatabaseError),

    // Configuration errors
    Configuration(ConfigurationError),

    // Data parsing & validation errors
    Data(DataError),

    // Strategy state concurrency errors
    State(StateError),
}

impl std::fmt::Display for DcaBotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DcaBotError::Exchange(e) => write!(f, "Exchange Error: {}", e),
            DcaBotError::Network(e) => write!(f, "Network Error: {}", e),
            DcaBotError::Database(e) => write!(f, "Database Error: {}", e),
            DcaBotError::Configuration(e) => write!(f, "Configuration Error: {}", e),
            DcaBotError::Data(e) => write!(f, "Data Error: {}", e),
            DcaBotError::State(e) => write!(f, "State Error: {}", e),
        }
    }
}

impl std::error::Error for DcaBotError {}

// =============================================================================
// NETWORK ERROR TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub enum NetworkError {
    HttpStatusError {
        endpoint: String,
        status: u16,
    },
    Generic {
        message: String,
    },
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::HttpStatusError { endpoint, status } => {
                write!(f, "HTTP {} from {}", status, endpoint)
            }
            NetworkError::Generic { message } => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// DATABASE ERROR TYPES
// =============================================================================

#[derive(Debug)]
pub enum DatabaseError {
    Sqlite(rusqlite::Error),
    /// A reserve decrement would push the balance below zero; rejected before commit
    ReserveWouldGoNegative {
        exchange: String,
        balance: f64,
        requested: f64,
    },
    Generic {
        message: String,
    },
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseError::Sqlite(e) => write!(f, "{}", e),
            DatabaseError::ReserveWouldGoNegative {
                exchange,
                balance,
                requested,
            } => {
                write!(
                    f,
                    "Reserve decrement rejected for {}: balance {:.2} < requested {:.2}",
                    exchange, balance, requested
                )
            }
            DatabaseError::Generic { message } => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// CONFIGURATION ERROR TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub enum ConfigurationError {
    InvalidConfig { field: String, reason: String },
    MissingCredentials { exchange: String },
    Generic { message: String },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationError::InvalidConfig { field, reason } => {
                write!(f, "Invalid config field '{}': {}", field, reason)
            }
            ConfigurationError::MissingCredentials { exchange } => {
                write!(f, "Missing API credentials for {}", exchange)
            }
            ConfigurationError::Generic { message } => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// DATA ERROR TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub enum DataError {
    ParseError {
        data_type: String,
        error: String,
    },
    InvalidAmount {
        amount: String,
        reason: String,
    },
    Generic {
        message: String,
    },
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::ParseError { data_type, error } => {
                write!(f, "Failed to parse {}: {}", data_type, error)
            }
            DataError::InvalidAmount { amount, reason } => {
                write!(f, "Invalid amount '{}': {}", amount, reason)
            }
            DataError::Generic { message } => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// STRATEGY STATE ERROR TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub enum StateError {
    /// CAS retries exhausted; a concurrent writer kept winning
    VersionConflict { attempts: u32 },
    /// The singleton strategy_state row is missing
    NotInitialized,
    Generic { message: String },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::VersionConflict { attempts } => {
                write!(f, "Strategy state version conflict after {} attempts", attempts)
            }
            StateError::NotInitialized => write!(f, "Strategy state row not initialized"),
            StateError::Generic { message } => write!(f, "{}", message),
        }
    }
}

// =============================================================================
// ERROR CONVERSIONS
// =============================================================================

impl From<ExchangeError> for DcaBotError {
    fn from(err: ExchangeError) -> Self {
        DcaBotError::Exchange(err)
    }
}

impl From<rusqlite::Error> for DcaBotError {
    fn from(err: rusqlite::Error) -> Self {
        DcaBotError::Database(DatabaseError::Sqlite(err))
    }
}

impl From<serde_json::Error> for DcaBotError {
    fn from(err: serde_json::Error) -> Self {
        DcaBotError::Data(DataError::ParseError {
            data_type: "JSON".to_string(),
            error: err.to_string(),
        })
    }
}

impl From<String> for DcaBotError {
    fn from(err: String) -> Self {
        DcaBotError::Data(DataError::Generic { message: err })
    }
}

impl From<reqwest::Error> for DcaBotError {
    fn from(err: reqwest::Error) -> Self {
        DcaBotError::Network(NetworkError::Generic {
            message: format!("HTTP request failed: {}", err),
        })
    }
}

// =============================================================================
// STRUCTURED ERROR BUILDERS
// =============================================================================

impl DcaBotError {
    /// Create an invalid amount error
    pub fn invalid_amount(amount: impl Into<String>, reason: impl Into<String>) -> Self {
        DcaBotError::Data(DataError::InvalidAmount {
            amount: amount.into(),
            reason: reason.into(),
        })
    }

    /// Create a configuration error
    pub fn configuration_error(message: impl Into<String>) -> Self {
        DcaBotError::Configuration(ConfigurationError::Generic {
            message: message.into(),
        })
    }

    /// Create a database error from a plain message
    pub fn database_error(message: impl Into<String>) -> Self {
        DcaBotError::Database(DatabaseError::Generic {
            message: message.into(),
        })
    }

    /// Create a network error from a plain message
    pub fn network_error(message: impl Into<String>) -> Self {
        DcaBotError::Network(NetworkError::Generic {
            message: message.into(),
        })
    }
}
