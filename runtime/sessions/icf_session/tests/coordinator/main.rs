use fixtures::{SESSION_COOKIE, Z_TEST, Z_TEST_SOURCE, config, logged_in, logged_in_with};
use googletest::{
    assert_that,
    prelude::{eq, none, not, some},
};
use helpers::{exception, lock_granted, ok, session_type, status, with_context_id, with_set_cookie};
use icf_session::coordinator::errors::CoordinatorError;
use icf_session::lock::errors::LockInvalidReason;
use icf_session::wire::CONTEXT_ID_COOKIE;
use icf_session::{AccessMode, ContextState, Operation, SessionCookie};
use itertools::Itertools;

mod config;
mod fixtures;

// The coordinator is meant to be shared across tasks.
static_assertions::assert_impl_all!(icf_session::RequestCoordinator: Send, Sync);

#[tokio::test]
async fn a_lock_is_unusable_once_its_context_is_released() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    assert!(acquired.handle.is_live());

    let released = coordinator.release_context().await;
    assert_that!(released, some(eq(acquired.handle.context())));
    assert!(!acquired.handle.is_live());
    call_tracker.reset_request_log().await;

    let err = coordinator
        .modify(&acquired.handle, Z_TEST_SOURCE, "REPORT z_test.")
        .await
        .unwrap_err();
    assert!(err.is_context_level());
    let CoordinatorError::LockInvalid(invalid) = &err else {
        panic!("Expected a `LockInvalid` error, got {err:?}");
    };
    assert_that!(invalid.object_uri.as_str(), eq(Z_TEST));
    assert_that!(invalid.reason, eq(LockInvalidReason::ContextEnded));

    // Validation happens locally.
    call_tracker.assert_transport_was_untouched().await;
}

#[tokio::test]
async fn stateful_operations_share_a_single_context() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("FIRST"), "CTX1"))
        .await;
    call_tracker.respond(lock_granted("SECOND")).await;

    let first = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    let context = coordinator.current_context().await.unwrap();
    let second = coordinator
        .lock("/sap/bc/adt/programs/programs/z_other", AccessMode::Modify)
        .await
        .unwrap();

    assert_that!(first.handle.context(), eq(context.key()));
    assert_that!(second.handle.context(), eq(context.key()));
    let still_current = coordinator.current_context().await.unwrap();
    assert_that!(still_current.key(), eq(context.key()));
    assert_that!(
        coordinator.context_state(&context).await,
        eq(ContextState::Active)
    );
    assert_that!(coordinator.held_locks().await.len(), eq(2));

    let requests = call_tracker.requests().await;
    assert_that!(requests.len(), eq(2));
    assert!(requests.iter().all(|r| session_type(r) == "stateful"));
    // The first request asks for a context, the second one reuses it.
    assert_that!(requests[0].cookie(CONTEXT_ID_COOKIE), none());
    assert_that!(requests[1].cookie(CONTEXT_ID_COOKIE), some(eq("CTX1")));
    assert_that!(
        requests[0].path.as_str(),
        eq("/sap/bc/adt/programs/programs/z_test?_action=LOCK&accessMode=MODIFY")
    );
}

#[tokio::test]
async fn concurrent_stateful_operations_do_not_open_a_second_context() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker.respond(with_context_id(ok(), "CTX1")).await;
    call_tracker.respond(ok()).await;

    let (first, second) = tokio::join!(
        coordinator.dispatch(Operation::read("/sap/bc/adt/first"), true),
        coordinator.dispatch(Operation::read("/sap/bc/adt/second"), true),
    );
    first.unwrap();
    second.unwrap();

    let context_ids = call_tracker
        .requests()
        .await
        .iter()
        .map(|r| r.cookie(CONTEXT_ID_COOKIE).map(ToOwned::to_owned))
        .collect_vec();
    assert_eq!(context_ids, vec![None, Some("CTX1".to_owned())]);
}

#[tokio::test]
async fn stateless_dispatch_never_touches_contexts() {
    let (coordinator, call_tracker) = logged_in().await;

    coordinator.read("/sap/bc/adt/discovery").await.unwrap();
    assert!(coordinator.current_context().await.is_none());

    // Open a context, then go stateless again.
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    let context = coordinator.current_context().await.unwrap();
    coordinator.read("/sap/bc/adt/discovery").await.unwrap();

    let requests = call_tracker.requests().await;
    assert_that!(session_type(&requests[0]), eq("stateless"));
    assert_that!(session_type(&requests[2]), eq("stateless"));
    assert_that!(requests[2].cookie(CONTEXT_ID_COOKIE), none());
    assert_that!(requests[2].cookie(SESSION_COOKIE), some(eq("initial")));

    let still_current = coordinator.current_context().await.unwrap();
    assert_that!(still_current.key(), eq(context.key()));
}

#[tokio::test]
async fn session_expiry_cascades_to_contexts_and_locks() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    let context = coordinator.current_context().await.unwrap();

    call_tracker.respond(status(401)).await;
    let err = coordinator.read("/sap/bc/adt/discovery").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionExpired(_)));
    assert!(err.is_session_level());
    assert!(!err.is_context_level());

    assert!(coordinator.session().await.is_none());
    assert!(coordinator.current_context().await.is_none());
    assert_that!(
        coordinator.context_state(&context).await,
        eq(ContextState::Expired)
    );
    assert!(!acquired.handle.is_live());
    assert!(coordinator.held_locks().await.is_empty());

    let err = coordinator
        .modify(&acquired.handle, Z_TEST_SOURCE, "REPORT z_test.")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoActiveSession(_)));
}

#[tokio::test]
async fn a_removal_cookie_for_the_session_ends_it() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_set_cookie(
            ok(),
            "SAP_SESSIONID_A4H_001=; path=/; expires=Thu, 01-Jan-1970 00:00:00 GMT",
        ))
        .await;

    let err = coordinator.read("/sap/bc/adt/discovery").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionExpired(_)));
    assert!(coordinator.session().await.is_none());
}

#[tokio::test]
async fn a_removal_cookie_for_the_context_ends_it() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    let context = coordinator.current_context().await.unwrap();

    call_tracker
        .respond(with_set_cookie(
            ok(),
            "sap-contextid=; path=/sap/bc/adt; expires=Tue, 01-Jan-1980 00:00:01 GMT",
        ))
        .await;
    coordinator
        .dispatch(Operation::read(Z_TEST_SOURCE), true)
        .await
        .unwrap();

    assert!(coordinator.session().await.is_some());
    assert!(!acquired.handle.is_live());
    assert!(coordinator.held_locks().await.is_empty());
    assert_that!(
        coordinator.context_state(&context).await,
        eq(ContextState::Expired)
    );
}

#[tokio::test]
async fn session_expiry_is_never_retried() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker.respond(status(401)).await;

    let err = coordinator
        .dispatch(Operation::read("/sap/bc/adt/repository"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionExpired(_)));
    assert_that!(call_tracker.requests().await.len(), eq(1));
}

#[tokio::test]
async fn every_dispatch_fails_without_a_session_cookie() {
    let (coordinator, call_tracker) = logged_in().await;
    assert!(coordinator.clear_session().await.is_some());

    let err = coordinator.read("/sap/bc/adt/discovery").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NoActiveSession(_)));
    let err = coordinator
        .lock(Z_TEST, AccessMode::Modify)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoActiveSession(_)));
    assert!(err.is_session_level());
    call_tracker.assert_transport_was_untouched().await;

    // A new session cookie makes the coordinator usable again.
    coordinator
        .set_session_cookie(SessionCookie::new(SESSION_COOKIE, "fresh"))
        .await;
    coordinator.read("/sap/bc/adt/discovery").await.unwrap();
    let request = call_tracker.last_request().await;
    assert_that!(request.cookie(SESSION_COOKIE), some(eq("fresh")));
}

#[tokio::test]
async fn context_expiry_is_retried_once_in_a_fresh_context() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker.respond(with_context_id(ok(), "CTX1")).await;
    coordinator
        .dispatch(Operation::read("/sap/bc/adt/repository"), true)
        .await
        .unwrap();
    let expired = coordinator.current_context().await.unwrap();

    call_tracker
        .respond(exception(
            400,
            "ExceptionResourceInvalidLockHandle",
            "Resource is not locked (invalid lock handle)",
        ))
        .await;
    call_tracker.respond(with_context_id(ok(), "CTX2")).await;
    coordinator
        .dispatch(Operation::read("/sap/bc/adt/repository"), true)
        .await
        .unwrap();

    let requests = call_tracker.requests().await;
    assert_that!(requests.len(), eq(3));
    assert_that!(requests[1].cookie(CONTEXT_ID_COOKIE), some(eq("CTX1")));
    // The retry runs in a brand new context.
    assert_that!(requests[2].cookie(CONTEXT_ID_COOKIE), none());

    assert_that!(
        coordinator.context_state(&expired).await,
        eq(ContextState::Expired)
    );
    let fresh = coordinator.current_context().await.unwrap();
    assert_that!(fresh.key(), not(eq(expired.key())));
    assert_that!(
        coordinator.context_state(&fresh).await,
        eq(ContextState::Active)
    );
}

#[tokio::test]
async fn context_expiry_is_surfaced_if_the_retry_fails_too() {
    let (coordinator, call_tracker) = logged_in().await;
    for _ in 0..2 {
        call_tracker
            .respond(exception(400, "ExceptionResourceNoLockHandle", "No lock handle"))
            .await;
    }

    let err = coordinator
        .dispatch(Operation::read("/sap/bc/adt/repository"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::ContextExpired(_)));
    assert!(err.is_context_level());
    assert_that!(call_tracker.requests().await.len(), eq(2));
}

#[tokio::test]
async fn context_expiry_is_not_retried_if_disabled() {
    let mut config = config();
    config.state.retry_on_context_expiry = false;
    let (coordinator, call_tracker) = logged_in_with(config).await;
    call_tracker
        .respond(exception(
            400,
            "ExceptionResourceInvalidLockHandle",
            "Lock handle is not valid",
        ))
        .await;

    let err = coordinator
        .dispatch(Operation::read("/sap/bc/adt/repository"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::ContextExpired(_)));
    assert_that!(call_tracker.requests().await.len(), eq(1));
}

#[tokio::test]
async fn operations_carrying_a_lock_are_not_retried_after_a_locked_status() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();

    // `423 Locked`, but the payload says the handle is gone.
    call_tracker
        .respond(exception(
            423,
            "ExceptionResourceLocked",
            "Lock handle is not valid",
        ))
        .await;
    let err = coordinator
        .modify(&acquired.handle, Z_TEST_SOURCE, "REPORT z_test.")
        .await
        .unwrap_err();
    let CoordinatorError::ContextExpired(expired) = &err else {
        panic!("Expected a `ContextExpired` error, got {err:?}");
    };
    assert_that!(expired.context, some(eq(acquired.handle.context())));
    assert_that!(
        expired.message.as_deref(),
        some(eq("Lock handle is not valid"))
    );

    assert_that!(call_tracker.requests().await.len(), eq(2));
    assert!(!acquired.handle.is_live());
    assert!(coordinator.held_locks().await.is_empty());
}

#[tokio::test]
async fn duplicate_locks_are_surfaced_immediately() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(exception(
            403,
            "ExceptionResourceAlreadyLocked",
            "User DEVELOPER is currently editing Z_TEST",
        ))
        .await;

    let err = coordinator
        .lock(Z_TEST, AccessMode::Modify)
        .await
        .unwrap_err();
    assert!(!err.is_context_level());
    assert!(!err.is_session_level());
    let CoordinatorError::DuplicateLock(duplicate) = &err else {
        panic!("Expected a `DuplicateLock` error, got {err:?}");
    };
    assert_that!(duplicate.object_uri.as_str(), eq(Z_TEST));
    assert_that!(duplicate.holder, none());
    assert_that!(
        duplicate.message.as_deref(),
        some(eq("User DEVELOPER is currently editing Z_TEST"))
    );

    assert_that!(call_tracker.requests().await.len(), eq(1));
    assert!(coordinator.held_locks().await.is_empty());
}

#[tokio::test]
async fn a_new_session_cookie_value_starts_a_new_generation() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    let before = coordinator.session().await.unwrap();

    call_tracker
        .respond(with_set_cookie(ok(), "SAP_SESSIONID_A4H_001=rotated; path=/"))
        .await;
    coordinator.read("/sap/bc/adt/discovery").await.unwrap();

    let after = coordinator.session().await.unwrap();
    assert_that!(after.id(), not(eq(before.id())));
    assert!(after.is_alive());
    assert!(!before.is_alive());
    assert!(!acquired.handle.is_live());
    assert!(coordinator.held_locks().await.is_empty());

    coordinator.read("/sap/bc/adt/discovery").await.unwrap();
    let request = call_tracker.last_request().await;
    assert_that!(request.cookie(SESSION_COOKIE), some(eq("rotated")));
}

#[tokio::test]
async fn transport_failures_leave_the_bookkeeping_untouched() {
    let (coordinator, call_tracker) = logged_in().await;
    call_tracker
        .respond(with_context_id(lock_granted("HANDLE"), "CTX1"))
        .await;
    let acquired = coordinator.lock(Z_TEST, AccessMode::Modify).await.unwrap();
    call_tracker.fail("connection reset by peer").await;

    let err = coordinator.read("/sap/bc/adt/discovery").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Transport(_)));
    assert!(coordinator.session().await.is_some());
    assert!(acquired.handle.is_live());
    assert_that!(coordinator.held_locks().await.len(), eq(1));
}
