//! Decides what the user sees: a loading state, the credential form, or the
//! task list of the signed-in user.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::{AuthProvider, AuthSubscription, User};
use crate::error::ValidationError;

pub const SIGNED_IN_NOTICE: &str = "Signed in successfully!";
pub const VERIFY_EMAIL_NOTICE: &str = "Account created! Please check your email to verify.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    SignIn,
    SignUp,
}

impl AuthMode {
    pub fn toggled(self) -> Self {
        match self {
            AuthMode::SignIn => AuthMode::SignUp,
            AuthMode::SignUp => AuthMode::SignIn,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialForm {
    pub mode: AuthMode,
    pub email: String,
    pub password: String,
    pub error: Option<String>,
    pub notice: Option<String>,
}

impl CredentialForm {
    pub fn toggle_mode(&mut self) {
        self.mode = self.mode.toggled();
        self.error = None;
        self.notice = None;
    }

    fn clear_credentials(&mut self) {
        self.email.clear();
        self.password.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Loading,
    Resolved(Option<User>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateView<'a> {
    Loading,
    CredentialForm(&'a CredentialForm),
    Tasks(&'a User),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    SignedIn(User),
    /// Account created; it cannot be used until the address is verified.
    VerificationPending,
    Rejected,
}

pub struct SessionGate {
    auth: Arc<dyn AuthProvider>,
    state: GateState,
    form: CredentialForm,
    subscription: Option<AuthSubscription>,
}

impl SessionGate {
    /// Subscribes to auth changes right away; the gate stays in the loading
    /// state until [`SessionGate::resolve`] runs.
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        let subscription = auth.subscribe();
        Self {
            auth,
            state: GateState::Loading,
            form: CredentialForm::default(),
            subscription: Some(subscription),
        }
    }

    /// `new` followed by `resolve`.
    pub async fn mount(auth: Arc<dyn AuthProvider>) -> Self {
        let mut gate = Self::new(auth);
        gate.resolve().await;
        gate
    }

    #[instrument(skip(self))]
    pub async fn resolve(&mut self) {
        match self.auth.current_user().await {
            Ok(user) => {
                debug!(signed_in = user.is_some(), "session resolved");
                self.state = GateState::Resolved(user);
            }
            Err(err) => {
                warn!(error = %err, "failed to get user");
                self.form.error = Some("Failed to get user".to_string());
                self.state = GateState::Resolved(None);
            }
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn view(&self) -> GateView<'_> {
        match &self.state {
            GateState::Loading => GateView::Loading,
            GateState::Resolved(Some(user)) => GateView::Tasks(user),
            GateState::Resolved(None) => GateView::CredentialForm(&self.form),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state == GateState::Loading
    }

    pub fn is_authenticated(&self) -> bool {
        self.user().is_some()
    }

    pub fn user(&self) -> Option<&User> {
        match &self.state {
            GateState::Resolved(user) => user.as_ref(),
            GateState::Loading => None,
        }
    }

    pub fn form(&self) -> &CredentialForm {
        &self.form
    }

    pub fn form_mut(&mut self) -> &mut CredentialForm {
        &mut self.form
    }

    /// Submits the credential form in its current mode.
    #[instrument(skip(self))]
    pub async fn submit(&mut self) -> SubmitOutcome {
        self.form.error = None;
        self.form.notice = None;

        let email = self.form.email.trim().to_string();
        if email.is_empty() || self.form.password.trim().is_empty() {
            self.form.error = Some(ValidationError::MissingCredentials.to_string());
            return SubmitOutcome::Rejected;
        }

        match self.form.mode {
            AuthMode::SignIn => match self.auth.sign_in(&email, &self.form.password).await {
                Ok(user) => {
                    info!(user = %user.id, "signed in");
                    self.form.notice = Some(SIGNED_IN_NOTICE.to_string());
                    self.form.clear_credentials();
                    self.state = GateState::Resolved(Some(user.clone()));
                    SubmitOutcome::SignedIn(user)
                }
                Err(err) => {
                    warn!(error = %err, "sign in rejected");
                    self.form.error = Some(err.to_string());
                    SubmitOutcome::Rejected
                }
            },
            AuthMode::SignUp => match self.auth.sign_up(&email, &self.form.password).await {
                Ok(user) => {
                    info!(user = %user.id, "account created");
                    self.form.notice = Some(VERIFY_EMAIL_NOTICE.to_string());
                    self.form.clear_credentials();
                    SubmitOutcome::VerificationPending
                }
                Err(err) => {
                    warn!(error = %err, "sign up rejected");
                    self.form.error = Some(err.to_string());
                    SubmitOutcome::Rejected
                }
            },
        }
    }

    #[instrument(skip(self))]
    pub async fn sign_out(&mut self) -> bool {
        match self.auth.sign_out().await {
            Ok(()) => {
                info!("signed out");
                self.state = GateState::Resolved(None);
                true
            }
            Err(err) => {
                warn!(error = %err, "sign out failed");
                self.form.error = Some("Failed to sign out".to_string());
                false
            }
        }
    }

    /// Waits for the next auth change and applies it. Returns false once the
    /// gate is unmounted or the provider is gone.
    pub async fn next_change(&mut self) -> bool {
        let Some(subscription) = self.subscription.as_mut() else {
            return false;
        };
        match subscription.changed().await {
            Some(user) => {
                debug!(signed_in = user.is_some(), "auth state changed");
                self.state = GateState::Resolved(user);
                true
            }
            None => false,
        }
    }

    /// Releases the auth subscription.
    pub fn unmount(&mut self) {
        if self.subscription.take().is_some() {
            debug!("auth subscription released");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AuthMode, GateView, SessionGate, SubmitOutcome, VERIFY_EMAIL_NOTICE};
    use crate::memory::{MemoryBackend, Op};

    #[tokio::test]
    async fn gate_starts_loading_then_shows_form() {
        let backend = Arc::new(MemoryBackend::new());
        let mut gate = SessionGate::new(backend.clone());
        assert!(gate.is_loading());
        assert_eq!(gate.view(), GateView::Loading);

        gate.resolve().await;
        assert!(matches!(gate.view(), GateView::CredentialForm(_)));
        assert!(!gate.is_authenticated());
    }

    #[tokio::test]
    async fn failing_lookup_reports_error_and_shows_form() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next(Op::CurrentUser);
        let gate = SessionGate::mount(backend.clone()).await;
        assert_eq!(gate.form().error.as_deref(), Some("Failed to get user"));
        assert!(matches!(gate.view(), GateView::CredentialForm(_)));
    }

    #[tokio::test]
    async fn blank_credentials_never_reach_the_provider() {
        let backend = Arc::new(MemoryBackend::new());
        let mut gate = SessionGate::mount(backend.clone()).await;
        gate.form_mut().email = "  ".to_string();
        gate.form_mut().password = "secret".to_string();

        assert_eq!(gate.submit().await, SubmitOutcome::Rejected);
        assert_eq!(
            gate.form().error.as_deref(),
            Some("Please enter email and password")
        );
        assert_eq!(backend.calls(Op::SignIn), 0);

        gate.form_mut().email = "ada@example.com".to_string();
        gate.form_mut().password = " \t ".to_string();
        assert_eq!(gate.submit().await, SubmitOutcome::Rejected);
        assert_eq!(
            gate.form().error.as_deref(),
            Some("Please enter email and password")
        );
        assert_eq!(backend.calls(Op::SignIn), 0);
    }

    #[tokio::test]
    async fn sign_up_leaves_user_signed_out() {
        let backend = Arc::new(MemoryBackend::new().requiring_confirmation());
        let mut gate = SessionGate::mount(backend.clone()).await;
        gate.form_mut().toggle_mode();
        assert_eq!(gate.form().mode, AuthMode::SignUp);
        gate.form_mut().email = "ada@example.com".to_string();
        gate.form_mut().password = "hunter22".to_string();

        assert_eq!(gate.submit().await, SubmitOutcome::VerificationPending);
        assert_eq!(gate.form().notice.as_deref(), Some(VERIFY_EMAIL_NOTICE));
        assert!(gate.form().email.is_empty());
        assert!(!gate.is_authenticated());
    }
}
