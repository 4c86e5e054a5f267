use std::sync::Arc;

use tally_core::backend::AuthProvider;
use tally_core::memory::{MemoryBackend, Op};
use tally_core::session::{
    AuthMode, GateView, SIGNED_IN_NOTICE, SessionGate, SubmitOutcome, VERIFY_EMAIL_NOTICE,
};
use tally_core::store::{StoreSettings, TaskStore};
use tempfile::tempdir;

#[tokio::test]
async fn sign_in_through_the_form_shows_the_task_list() {
    let backend = Arc::new(MemoryBackend::new());
    backend.register("grace@example.com", "cobol-1959");
    let mut gate = SessionGate::mount(backend.clone()).await;
    assert!(matches!(gate.view(), GateView::CredentialForm(_)));

    let form = gate.form_mut();
    form.email = "grace@example.com".to_string();
    form.password = "wrong".to_string();
    assert_eq!(gate.submit().await, SubmitOutcome::Rejected);
    assert_eq!(
        gate.form().error.as_deref(),
        Some("Invalid login credentials")
    );
    assert!(!gate.is_authenticated());

    gate.form_mut().password = "cobol-1959".to_string();
    let outcome = gate.submit().await;
    assert!(matches!(outcome, SubmitOutcome::SignedIn(_)));
    assert_eq!(gate.form().notice.as_deref(), Some(SIGNED_IN_NOTICE));
    assert_eq!(gate.form().error, None);
    assert!(gate.form().password.is_empty());

    let user = gate.user().cloned().expect("signed in");
    assert_eq!(user.email.as_deref(), Some("grace@example.com"));
    assert_eq!(gate.view(), GateView::Tasks(&user));

    let mut store = TaskStore::new(backend.clone(), StoreSettings::default());
    store.load(&user).await;
    assert_eq!(store.owner(), Some(user.id));
    assert_eq!(store.warning(), None);
}

#[tokio::test]
async fn unverified_sign_up_cannot_sign_in_until_confirmed() {
    let backend = Arc::new(MemoryBackend::new().requiring_confirmation());
    let mut gate = SessionGate::mount(backend.clone()).await;

    gate.form_mut().mode = AuthMode::SignUp;
    gate.form_mut().email = "linus@example.com".to_string();
    gate.form_mut().password = "penguin!".to_string();
    assert_eq!(gate.submit().await, SubmitOutcome::VerificationPending);
    assert_eq!(gate.form().notice.as_deref(), Some(VERIFY_EMAIL_NOTICE));
    assert!(!gate.is_authenticated());

    gate.form_mut().toggle_mode();
    assert_eq!(gate.form().mode, AuthMode::SignIn);
    gate.form_mut().email = "linus@example.com".to_string();
    gate.form_mut().password = "penguin!".to_string();
    assert_eq!(gate.submit().await, SubmitOutcome::Rejected);
    assert_eq!(gate.form().error.as_deref(), Some("Email not confirmed"));

    assert!(backend.confirm_email("linus@example.com"));
    gate.form_mut().email = "linus@example.com".to_string();
    gate.form_mut().password = "penguin!".to_string();
    assert!(matches!(gate.submit().await, SubmitOutcome::SignedIn(_)));
}

#[tokio::test]
async fn gate_follows_auth_changes_until_unmounted() {
    let backend = Arc::new(MemoryBackend::new());
    backend.register("ken@example.com", "unix-1969");
    let mut gate = SessionGate::mount(backend.clone()).await;
    assert_eq!(backend.events().subscriber_count(), 1);

    backend
        .sign_in("ken@example.com", "unix-1969")
        .await
        .expect("sign in");
    assert!(gate.next_change().await);
    assert!(gate.is_authenticated());

    backend.sign_out().await.expect("sign out");
    assert!(gate.next_change().await);
    assert!(matches!(gate.view(), GateView::CredentialForm(_)));

    gate.unmount();
    assert!(!gate.is_subscribed());
    assert_eq!(backend.events().subscriber_count(), 0);
    assert!(!gate.next_change().await);
}

#[tokio::test]
async fn failed_sign_out_keeps_user_signed_in() {
    let backend = Arc::new(MemoryBackend::new());
    backend.register("barbara@example.com", "clu-1974");
    backend
        .sign_in("barbara@example.com", "clu-1974")
        .await
        .expect("sign in");
    let mut gate = SessionGate::mount(backend.clone()).await;
    assert!(gate.is_authenticated());

    backend.fail_next(Op::SignOut);
    assert!(!gate.sign_out().await);
    assert_eq!(gate.form().error.as_deref(), Some("Failed to sign out"));
    assert!(gate.is_authenticated());

    assert!(gate.sign_out().await);
    assert!(!gate.is_authenticated());
}

#[tokio::test]
async fn local_backend_session_survives_reopen() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("local.json");

    {
        let backend = Arc::new(MemoryBackend::open(&path).expect("open local backend"));
        let mut gate = SessionGate::mount(backend.clone()).await;
        gate.form_mut().mode = AuthMode::SignUp;
        gate.form_mut().email = "margaret@example.com".to_string();
        gate.form_mut().password = "apollo-11".to_string();
        assert_eq!(gate.submit().await, SubmitOutcome::VerificationPending);

        gate.form_mut().mode = AuthMode::SignIn;
        gate.form_mut().email = "margaret@example.com".to_string();
        gate.form_mut().password = "apollo-11".to_string();
        assert!(matches!(gate.submit().await, SubmitOutcome::SignedIn(_)));
    }

    let backend = Arc::new(MemoryBackend::open(&path).expect("reopen local backend"));
    let gate = SessionGate::mount(backend).await;
    assert_eq!(
        gate.user().and_then(|user| user.email.as_deref()),
        Some("margaret@example.com")
    );
}
