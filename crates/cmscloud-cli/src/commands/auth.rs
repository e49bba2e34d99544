//! Login and logout handlers

use anyhow::{bail, Result};
use cmscloud_core::{ApiClient, Confirm};

use crate::output::Output;
use crate::prompt;

/// Log in, prompting for whatever was not given on the command line
pub async fn login(
    api: &ApiClient,
    email: Option<String>,
    password: Option<String>,
    interactive: bool,
    output: &Output,
) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None if interactive => prompt::prompt("Email: ")?,
        None => bail!("--email is required in non-interactive mode"),
    };
    let password = match password {
        Some(password) => password,
        None if interactive => prompt::prompt_password("Password:")?,
        None => bail!("--password is required in non-interactive mode"),
    };
    if email.is_empty() {
        bail!("Email must not be empty");
    }

    let message = api.login(&email, &password).await?;
    output.success(&message);
    Ok(())
}

/// Forget the stored token; `confirm` is asked first when given
pub fn logout(api: &ApiClient, confirm: Option<&dyn Confirm>, output: &Output) -> Result<()> {
    if let Some(confirm) = confirm {
        if !confirm.confirm("Are you sure you want to continue?", None, false) {
            output.message("Aborted");
            return Ok(());
        }
    }

    if api.logout()? {
        output.success("Logged out");
    } else {
        output.message("Not logged in");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use cmscloud_core::{Credential, MemoryStore};

    use crate::output::OutputFormat;

    struct Answer {
        yes: bool,
        asked: AtomicUsize,
    }

    impl Confirm for Answer {
        fn confirm(&self, _question: &str, _message: Option<&str>, default: bool) -> bool {
            assert!(!default);
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.yes
        }
    }

    fn logged_in_client() -> ApiClient {
        let store = MemoryStore::with(
            "control.example.com",
            Credential {
                login: "me@example.com".to_string(),
                token: "t0ken".to_string(),
            },
        );
        ApiClient::with_host(
            "http://control.example.com",
            "control.example.com",
            Duration::from_secs(5),
            Arc::new(store),
        )
        .unwrap()
    }

    #[test]
    fn test_logout_declined_keeps_token() {
        let api = logged_in_client();
        let answer = Answer {
            yes: false,
            asked: AtomicUsize::new(0),
        };

        logout(&api, Some(&answer), &Output::new(OutputFormat::Quiet)).unwrap();
        assert_eq!(answer.asked.load(Ordering::SeqCst), 1);
        assert!(api.is_logged_in().unwrap());
    }

    #[test]
    fn test_logout_confirmed_forgets_token() {
        let api = logged_in_client();
        let answer = Answer {
            yes: true,
            asked: AtomicUsize::new(0),
        };

        logout(&api, Some(&answer), &Output::new(OutputFormat::Quiet)).unwrap();
        assert!(!api.is_logged_in().unwrap());
    }

    #[test]
    fn test_logout_without_confirmation_when_non_interactive() {
        let api = logged_in_client();
        logout(&api, None, &Output::new(OutputFormat::Quiet)).unwrap();
        assert!(!api.is_logged_in().unwrap());
    }

    #[tokio::test]
    async fn test_login_non_interactive_requires_password() {
        let api = ApiClient::with_host(
            "http://control.example.com",
            "control.example.com",
            Duration::from_secs(5),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let err = login(
            &api,
            Some("me@example.com".to_string()),
            None,
            false,
            &Output::new(OutputFormat::Quiet),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--password is required"));
    }
}
