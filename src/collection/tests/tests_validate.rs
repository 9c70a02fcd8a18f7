//! Unique-constraint validation under the batch's cumulative effect.

use crate::collection::tests::helpers::*;
use crate::collection::{CollectionCore, CollectionHooks};
use crate::index::IndexSpec;
use crate::store::StoreError;

fn core_with_email_index() -> CollectionCore<User> {
    let core = CollectionCore::<User>::new("users");
    core.define_index(IndexSpec::unique("email", |u: &User| {
        u.email.as_bytes().to_vec()
    }))
    .unwrap();
    core
}

#[test]
fn conflicting_puts_in_one_batch_are_rejected() {
    let core = core_with_email_index();

    let err = core
        .validate(&[put_op(&user(1, "a@x", &[])), put_op(&user(2, "a@x", &[]))])
        .unwrap_err();

    match err {
        StoreError::UniqueConstraint { index, key } => {
            assert_eq!(index, "email");
            assert_eq!(key, "a@x");
        }
        other => panic!("expected UniqueConstraint, got {other:?}"),
    }
}

#[test]
fn put_conflicting_with_committed_head_is_rejected() {
    let core = core_with_email_index();
    put(&core, &user(1, "taken@x", &[]), 1);

    assert!(core.validate(&[put_op(&user(2, "taken@x", &[]))]).is_err());
}

#[test]
fn rewriting_the_same_document_is_allowed() {
    let core = core_with_email_index();
    put(&core, &user(1, "a@x", &[]), 1);

    // Same id, same key: no conflict with itself.
    assert!(core.validate(&[put_op(&user(1, "a@x", &[]))]).is_ok());
}

#[test]
fn delete_then_put_frees_the_key_within_the_batch() {
    let core = core_with_email_index();
    put(&core, &user(1, "a@x", &[]), 1);

    // Cumulative effect: the delete releases "a@x" before id 2 claims it.
    assert!(core
        .validate(&[delete_op(1), put_op(&user(2, "a@x", &[]))])
        .is_ok());

    // Without the delete the same claim must fail.
    assert!(core.validate(&[put_op(&user(2, "a@x", &[]))]).is_err());
}

#[test]
fn key_move_frees_the_old_key_within_the_batch() {
    let core = core_with_email_index();
    put(&core, &user(1, "a@x", &[]), 1);

    // id 1 vacates "a@x" in the same batch where id 2 claims it.
    assert!(core
        .validate(&[put_op(&user(1, "b@x", &[])), put_op(&user(2, "a@x", &[]))])
        .is_ok());
}

#[test]
fn validation_has_no_side_effects() {
    let core = core_with_email_index();
    let _ = core.validate(&[put_op(&user(1, "a@x", &[]))]);

    assert!(core.by_index_at("email", b"a@x", u64::MAX).unwrap().is_empty());
    assert!(core.get_at(&id_json(1), u64::MAX).is_none());
}
