//! Low-level SMTP client.
//!
//! A thin command/response layer over a TCP connection that can be upgraded
//! with STARTTLS. It knows the wire format (multi-line replies, dot-stuffing,
//! SASL encodings) but makes no delivery decisions; that is the job of
//! [`crate::SmtpMailTransport`].
//!
//! ```no_run
//! use courier_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("localhost:2525", "localhost".to_string()).await?;
//! client.read_greeting().await?;
//! client.ehlo("courier.example.com").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data("Subject: Test\r\n\r\nHello World").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod capabilities;
mod error;
mod response;
mod smtp_client;

pub use auth::AuthMechanism;
pub use capabilities::Capabilities;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
