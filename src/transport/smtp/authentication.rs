//! SMTP authentication mechanisms.

use super::Error;

/// Username/secret pair for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    authentication_identity: String,
    secret: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Credentials {
        Credentials {
            authentication_identity: username,
            secret: password,
        }
    }
}

/// Supported mechanisms, in preference order.
pub const DEFAULT_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// RFC 4616: single base64 response carrying both identity and secret.
    Plain,
    /// Username and password sent in response to separate challenges.
    Login,
}

impl Mechanism {
    /// The mechanism name as advertised in the EHLO `AUTH` keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
        }
    }

    /// Whether the mechanism sends an initial response with the AUTH
    /// command itself.
    pub fn supports_initial_response(self) -> bool {
        match self {
            Mechanism::Plain => true,
            Mechanism::Login => false,
        }
    }

    /// The raw (not yet base64-encoded) response for a challenge.
    pub fn response(
        self,
        credentials: &Credentials,
        challenge: Option<&str>,
    ) -> Result<String, Error> {
        match self {
            Mechanism::Plain => match challenge {
                Some(_) => Err(Error::Client("unexpected PLAIN challenge")),
                None => Ok(format!(
                    "\u{0}{}\u{0}{}",
                    credentials.authentication_identity, credentials.secret
                )),
            },
            Mechanism::Login => {
                let challenge = challenge.ok_or(Error::Client("missing LOGIN challenge"))?;
                if challenge.eq_ignore_ascii_case("username:")
                    || challenge.eq_ignore_ascii_case("user name")
                {
                    Ok(credentials.authentication_identity.clone())
                } else if challenge.eq_ignore_ascii_case("password:")
                    || challenge.eq_ignore_ascii_case("password")
                {
                    Ok(credentials.secret.clone())
                } else {
                    Err(Error::Client("unrecognized LOGIN challenge"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("user".to_string(), "pass".to_string())
    }

    #[test]
    fn plain_packs_identity_and_secret() {
        let response = Mechanism::Plain.response(&credentials(), None).unwrap();
        assert_eq!(response, "\u{0}user\u{0}pass");
        assert_eq!(base64::encode(&response), "AHVzZXIAcGFzcw==");
    }

    #[test]
    fn plain_rejects_challenges() {
        assert!(Mechanism::Plain
            .response(&credentials(), Some("huh"))
            .is_err());
    }

    #[test]
    fn login_answers_both_challenges() {
        let creds = credentials();
        assert_eq!(
            Mechanism::Login.response(&creds, Some("Username:")).unwrap(),
            "user"
        );
        assert_eq!(
            Mechanism::Login.response(&creds, Some("Password:")).unwrap(),
            "pass"
        );
        assert!(Mechanism::Login.response(&creds, None).is_err());
        assert!(Mechanism::Login.response(&creds, Some("what")).is_err());
    }
}
