//! SMTP AUTH (RFC 4954) with the PLAIN and LOGIN mechanisms.

use std::fmt;

use base64::Engine;

use super::{
    capabilities::Capabilities,
    error::{ClientError, Result},
    response::Response,
    smtp_client::SmtpClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    /// PLAIN when the server offers it, LOGIN otherwise.
    #[must_use]
    pub fn select(capabilities: &Capabilities) -> Self {
        if capabilities
            .auth_mechanisms()
            .iter()
            .any(|mechanism| mechanism == "PLAIN")
        {
            Self::Plain
        } else {
            Self::Login
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

fn encode(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

impl SmtpClient {
    /// Authenticate with `mechanism`.
    ///
    /// Returns the reply that ended the exchange: 235 on success, or whatever
    /// the server rejected it with.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, or if the server answers a LOGIN step
    /// with an intermediate code other than 334.
    pub async fn authenticate(
        &mut self,
        mechanism: AuthMechanism,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        match mechanism {
            AuthMechanism::Plain => {
                let token = encode(&format!("\0{username}\0{password}"));
                self.command_redacted(&format!("AUTH PLAIN {token}"), "AUTH PLAIN <credentials>")
                    .await
            }
            AuthMechanism::Login => {
                let reply = self.command("AUTH LOGIN").await?;
                if !Self::is_challenge(&reply)? {
                    return Ok(reply);
                }

                let reply = self
                    .command_redacted(&encode(username), "<username>")
                    .await?;
                if !Self::is_challenge(&reply)? {
                    return Ok(reply);
                }

                self.command_redacted(&encode(password), "<password>")
                    .await
            }
        }
    }

    fn is_challenge(reply: &Response) -> Result<bool> {
        match reply.code {
            334 => Ok(true),
            code if reply.is_intermediate() => Err(ClientError::UnexpectedResponse {
                code,
                message: reply.message(),
            }),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_select_prefers_plain() {
        let caps = Capabilities::from_ehlo(&Response::new(
            250,
            vec!["relay".to_string(), "AUTH LOGIN PLAIN".to_string()],
        ));
        assert_eq!(AuthMechanism::select(&caps), AuthMechanism::Plain);
    }

    #[test]
    fn test_select_falls_back_to_login() {
        let caps = Capabilities::from_ehlo(&Response::new(
            250,
            vec!["relay".to_string(), "AUTH LOGIN".to_string()],
        ));
        assert_eq!(AuthMechanism::select(&caps), AuthMechanism::Login);

        assert_eq!(
            AuthMechanism::select(&Capabilities::default()),
            AuthMechanism::Login
        );
    }

    #[test]
    fn test_plain_token() {
        assert_eq!(encode("\0user\0pass"), "AHVzZXIAcGFzcw==");
    }
}
