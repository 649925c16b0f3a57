use std::fmt;

/// Environment variable through which the dump command receives the
/// database credential.
pub const PASSWORD_ENV: &str = "PGPASSWORD";

/// A credential that must never reach logs or command lines.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plain value. Only for handing to a child environment.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Where the dump command connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub password: Secret,
}

impl ConnectionParams {
    /// Connection arguments in `pg_dump` form. Never includes the password.
    pub fn dump_args(&self) -> Vec<String> {
        vec![
            "-h".into(),
            self.host.clone(),
            "-p".into(),
            self.port.to_string(),
            "-U".into(),
            self.user.clone(),
            "-d".into(),
            self.database.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "db.internal".into(),
            port: 5432,
            user: "backup".into(),
            database: "orders".into(),
            password: Secret::new("hunter2"),
        }
    }

    #[test]
    fn debug_redacts_password() {
        let debug = format!("{:?}", params());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Secret(***)"));
    }

    #[test]
    fn dump_args_exclude_password() {
        let args = params().dump_args();
        assert_eq!(
            args,
            ["-h", "db.internal", "-p", "5432", "-U", "backup", "-d", "orders"]
        );
        assert!(!args.iter().any(|a| a.contains("hunter2")));
    }

    #[test]
    fn secret_expose() {
        let secret = Secret::from("s3cret".to_string());
        assert_eq!(secret.expose(), "s3cret");
        assert!(!secret.is_empty());
        assert!(Secret::default().is_empty());
    }
}
