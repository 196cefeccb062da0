use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The transports a channel can be built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Provider {
    Smtp,
    SendGrid,
    Mailgun,
    AmazonSes,
    ProtonMail,
    ZohoMail,
    Fastmail,
    Postmark,
    SparkPost,
    Mailjet,
    Custom,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown provider: {0}")]
pub struct UnknownProvider(String);

impl Provider {
    pub const ALL: [Self; 11] = [
        Self::Smtp,
        Self::SendGrid,
        Self::Mailgun,
        Self::AmazonSes,
        Self::ProtonMail,
        Self::ZohoMail,
        Self::Fastmail,
        Self::Postmark,
        Self::SparkPost,
        Self::Mailjet,
        Self::Custom,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::SendGrid => "sendgrid",
            Self::Mailgun => "mailgun",
            Self::AmazonSes => "amazon_ses",
            Self::ProtonMail => "protonmail",
            Self::ZohoMail => "zoho_mail",
            Self::Fastmail => "fastmail",
            Self::Postmark => "postmark",
            Self::SparkPost => "sparkpost",
            Self::Mailjet => "mailjet",
            Self::Custom => "custom",
        }
    }

    /// Whether this provider is reached over an HTTP API rather than SMTP
    #[must_use]
    pub const fn is_api(self) -> bool {
        !matches!(self, Self::Smtp)
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownProvider;

    /// Case-insensitive, treating `-`, ` ` and `_` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Ok(match normalised.as_str() {
            "smtp" => Self::Smtp,
            "sendgrid" => Self::SendGrid,
            "mailgun" => Self::Mailgun,
            "amazonses" | "ses" | "aws" => Self::AmazonSes,
            "protonmail" | "proton" => Self::ProtonMail,
            "zohomail" | "zoho" => Self::ZohoMail,
            "fastmail" => Self::Fastmail,
            "postmark" => Self::Postmark,
            "sparkpost" => Self::SparkPost,
            "mailjet" => Self::Mailjet,
            "custom" => Self::Custom,
            _ => return Err(UnknownProvider(s.to_string())),
        })
    }
}

impl TryFrom<String> for Provider {
    type Error = UnknownProvider;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Provider> for String {
    fn from(value: Provider) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_names() {
        assert_eq!("SMTP".parse(), Ok(Provider::Smtp));
        assert_eq!("SendGrid".parse(), Ok(Provider::SendGrid));
        assert_eq!("amazon-ses".parse(), Ok(Provider::AmazonSes));
        assert_eq!("Amazon SES".parse(), Ok(Provider::AmazonSes));
        assert_eq!("zoho_mail".parse(), Ok(Provider::ZohoMail));
        assert_eq!(
            "pigeon".parse::<Provider>(),
            Err(UnknownProvider("pigeon".to_string()))
        );
    }

    #[test]
    fn test_display_parses_back() {
        for provider in Provider::ALL {
            assert_eq!(provider.to_string().parse(), Ok(provider));
        }
    }

    #[test]
    fn test_is_api() {
        assert!(!Provider::Smtp.is_api());
        assert!(Provider::Mailgun.is_api());
    }
}
