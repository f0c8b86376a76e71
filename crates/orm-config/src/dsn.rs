//! Connection descriptors for the MySQL engine.

use crate::env::vars;
use crate::types::ResolvedConfig;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Socket directory used when `DB_SOCKET_DIR` is unset.
pub const DEFAULT_SOCKET_DIR: &str = "cloudsql";

/// Errors turning a descriptor into a driver URL.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("invalid connection url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid {component} in connection descriptor: {value}")]
    InvalidComponent {
        component: &'static str,
        value: String,
    },
}

/// Where and how to reach the production database.
///
/// `Display` renders the classic DSN forms:
///
/// - `user:password@unix(/socketDir/host)/dbname?charset=utf8mb4&parseTime=true`
/// - `user:password@tcp(host:port)/dbname?parseTime=true`
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Unix {
        user: String,
        password: String,
        socket_dir: String,
        host: String,
        database: String,
    },
    Tcp {
        user: String,
        password: String,
        host: String,
        port: u16,
        database: String,
    },
}

impl ConnectionDescriptor {
    /// Build the descriptor; `socket_dir` is only consulted in socket mode.
    pub fn build(config: &ResolvedConfig, socket_dir: Option<&str>) -> Self {
        if config.socket_mode {
            Self::Unix {
                user: config.user.clone(),
                password: config.password.clone(),
                socket_dir: socket_dir.unwrap_or(DEFAULT_SOCKET_DIR).to_string(),
                host: config.host.clone(),
                database: config.name.clone(),
            }
        } else {
            Self::Tcp {
                user: config.user.clone(),
                password: config.password.clone(),
                host: config.host.clone(),
                port: config.port,
                database: config.name.clone(),
            }
        }
    }

    /// Build the descriptor with the socket directory taken from `DB_SOCKET_DIR`.
    ///
    /// A variable that is set but empty still counts as set.
    pub fn from_env(config: &ResolvedConfig) -> Self {
        let socket_dir = std::env::var(vars::DB_SOCKET_DIR).ok();
        Self::build(config, socket_dir.as_deref())
    }

    /// Absolute socket path, in socket mode.
    pub fn socket_path(&self) -> Option<String> {
        match self {
            Self::Unix {
                socket_dir, host, ..
            } => Some(format!("/{}/{}", socket_dir, host)),
            Self::Tcp { .. } => None,
        }
    }

    /// The descriptor with the password masked, for logs.
    pub fn redacted(&self) -> String {
        let masked = match self.clone() {
            Self::Unix {
                user,
                socket_dir,
                host,
                database,
                ..
            } => Self::Unix {
                user,
                password: "****".to_string(),
                socket_dir,
                host,
                database,
            },
            Self::Tcp {
                user,
                host,
                port,
                database,
                ..
            } => Self::Tcp {
                user,
                password: "****".to_string(),
                host,
                port,
                database,
            },
        };
        masked.to_string()
    }

    /// Translate into a sqlx MySQL URL.
    ///
    /// Credentials are percent-encoded. `parseTime` has no counterpart: the
    /// driver always decodes temporal columns natively.
    pub fn to_url(&self) -> Result<Url, DescriptorError> {
        let (user, password, database) = match self {
            Self::Unix {
                user,
                password,
                database,
                ..
            }
            | Self::Tcp {
                user,
                password,
                database,
                ..
            } => (user, password, database),
        };

        let mut url = Url::parse("mysql://localhost")?;

        if let Self::Tcp { host, port, .. } = self {
            url.set_host(Some(host))?;
            url.set_port(Some(*port))
                .map_err(|_| DescriptorError::InvalidComponent {
                    component: "port",
                    value: port.to_string(),
                })?;
        }

        url.set_username(user)
            .map_err(|_| DescriptorError::InvalidComponent {
                component: "user",
                value: user.clone(),
            })?;
        if !password.is_empty() {
            url.set_password(Some(password))
                .map_err(|_| DescriptorError::InvalidComponent {
                    component: "password",
                    value: "****".to_string(),
                })?;
        }
        url.set_path(&format!("/{}", database));

        if let Some(socket) = self.socket_path() {
            url.query_pairs_mut()
                .append_pair("socket", &socket)
                .append_pair("charset", "utf8mb4");
        }

        Ok(url)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix {
                user,
                password,
                socket_dir,
                host,
                database,
            } => write!(
                f,
                "{}:{}@unix(/{}/{})/{}?charset=utf8mb4&parseTime=true",
                user, password, socket_dir, host, database
            ),
            Self::Tcp {
                user,
                password,
                host,
                port,
                database,
            } => write!(
                f,
                "{}:{}@tcp({}:{})/{}?parseTime=true",
                user, password, host, port, database
            ),
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
