mod support;

use chrono::Duration;

use iap_ledger::{
    domain::{
        entities::{
            generation::GenerationType,
            plan::PlanType,
            user_subscription::{SubscriptionState, UserSubscription},
            verification::VerificationResult,
        },
        repositories::ledger_store::LedgerStore,
        services::subscription_state_machine::SubscriptionChange,
    },
    errors::{LedgerError, ReversalStatus},
};

use support::{apple, google, harness, start, stripe};

#[tokio::test]
async fn replayed_purchase_is_applied_once() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;

    let first = h
        .util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();
    assert_eq!(first.message, "Subscribed");
    assert_eq!(first.change, Some(SubscriptionChange::Created));
    let credits = h.user("u1").await.credits;
    assert_eq!(credits.total_credits, 100);

    let second = h
        .util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();
    assert_eq!(second.message, "Already subscribed");
    assert_eq!(second.change, None);
    assert_eq!(second.subscription.id, first.subscription.id);
    assert_eq!(h.user("u1").await.credits, credits);
    assert_eq!(h.store.payment_records_for_user("u1").await.unwrap().len(), 1);
    assert_eq!(h.sender.events_for("u1"), vec!["new"]);
}

#[tokio::test]
async fn upgrade_carries_over_unused_credits() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    let premium_plus = h.add_plan("Premium Plus", PlanType::Premium, 19.99, 200).await;

    let first = h
        .util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();
    h.util
        .record_generation_usage("u1", GenerationType::Prompt, 30)
        .await
        .unwrap();

    let upgrade = h
        .util
        .subscribe("u1", &premium_plus.id, &h.paid(&premium_plus, "pi_2"))
        .await
        .unwrap();
    assert_eq!(upgrade.change, Some(SubscriptionChange::Upgraded));
    assert_eq!(upgrade.subscription.id, first.subscription.id);
    assert_eq!(upgrade.subscription.plan_id, premium_plus.id);

    let credits = h.user("u1").await.credits;
    assert_eq!(credits.total_credits, 270);
    assert_eq!(credits.prompt_generation_credits, 20 + 100);
    assert_eq!(credits.image_generation_credits, 50 + 100);
    assert_eq!(credits.used_prompt_credits, 0);
    assert_eq!(h.sender.events_for("u1"), vec!["new", "upgraded"]);
}

#[tokio::test]
async fn overdrawn_balance_carries_nothing() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    let premium_plus = h.add_plan("Premium Plus", PlanType::Premium, 19.99, 200).await;
    h.util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();

    let mut user = h.user("u1").await;
    user.credits.used_image_credits = 80;
    h.store.save_user(&user).await.unwrap();

    h.util
        .subscribe("u1", &premium_plus.id, &h.paid(&premium_plus, "pi_2"))
        .await
        .unwrap();
    let credits = h.user("u1").await.credits;
    assert_eq!(credits.image_generation_credits, 100);
    assert_eq!(credits.prompt_generation_credits, 50 + 100);
}

#[tokio::test]
async fn repeated_upgrades_keep_one_serving_record() {
    let h = harness().await;
    h.add_user("u1").await;
    let tiers = [
        h.add_plan("Basic", PlanType::Basic, 2.99, 50).await,
        h.add_plan("Standard", PlanType::Standard, 5.99, 150).await,
        h.add_plan("Premium", PlanType::Premium, 9.99, 300).await,
        h.add_plan("Premium Plus", PlanType::Premium, 19.99, 600).await,
    ];
    for (i, plan) in tiers.iter().enumerate() {
        h.util
            .subscribe("u1", &plan.id, &h.paid(plan, &format!("pi_{i}")))
            .await
            .unwrap();
    }

    let subscriptions = h.store.subscriptions_for_user("u1").await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(
        subscriptions
            .iter()
            .filter(|s| UserSubscription::is_active(s))
            .count(),
        1
    );
    assert_eq!(subscriptions[0].plan_id, tiers[3].id);
}

#[tokio::test]
async fn rejected_purchase_changes_nothing() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    h.storefront
        .verdict("pi_bad", VerificationResult::failed("requires_payment_method"));

    let err = h
        .util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_bad"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VerificationFailed(_)));
    assert_eq!(err.status_code(), 400);
    assert!(h.store.payment_records_for_user("u1").await.unwrap().is_empty());
    assert!(h.store.subscriptions_for_user("u1").await.unwrap().is_empty());
    assert!(h.user("u1").await.is_on_free_plan());
}

#[tokio::test]
async fn unrecordable_payment_is_reversed() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    h.store.set_read_only(true);

    let err = h
        .util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap_err();
    match err {
        LedgerError::PersistenceFailed { reversal, .. } => assert_eq!(
            reversal,
            ReversalStatus::Reversed {
                reference: "re_scripted".to_owned()
            }
        ),
        other => panic!("expected persistence failure, got {other:?}"),
    }
    assert_eq!(h.storefront.reversals.lock().unwrap().len(), 1);

    h.store.set_read_only(false);
    assert!(h.user("u1").await.is_on_free_plan());
}

#[tokio::test]
async fn purchase_cannot_be_claimed_by_another_account() {
    let h = harness().await;
    h.add_user("u1").await;
    h.add_user("u2").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    h.util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();

    let err = h
        .util
        .subscribe("u2", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VerificationFailed(_)));
    assert!(h.user("u2").await.is_on_free_plan());
}

#[tokio::test]
async fn storefront_expiry_sets_the_end_date() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    let request = apple(&premium, "2000000000000001");
    h.storefront.verdict(
        "eyJ.2000000000000001.sig",
        VerificationResult {
            expires_date: Some(start() + Duration::days(30)),
            ..VerificationResult::verified("2000000000000001")
        },
    );

    let response = h.util.subscribe("u1", &premium.id, &request).await.unwrap();
    assert_eq!(response.subscription.end_date, start() + Duration::days(30));
}

#[tokio::test]
async fn trial_is_offered_once() {
    let h = harness().await;
    h.add_user("u1").await;

    let trial = h.util.start_free_trial("u1").await.unwrap();
    assert!(trial.is_trial);
    assert!(!trial.auto_renew());
    assert_eq!(trial.end_date, start() + Duration::days(7));
    assert!(h.user("u1").await.membership.has_active_trial);

    h.util.cancel_subscription("u1", true).await.unwrap();
    let err = h.util.start_free_trial("u1").await.unwrap_err();
    assert!(matches!(err, LedgerError::TrialUnavailable(_)));
}

#[tokio::test]
async fn deferred_cancel_keeps_the_paid_plan() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    h.util
        .subscribe("u1", &premium.id, &h.paid(&premium, "pi_1"))
        .await
        .unwrap();
    let credits = h.user("u1").await.credits;

    let cancelled = h.util.cancel_subscription("u1", false).await.unwrap();
    assert!(matches!(
        cancelled.state,
        SubscriptionState::PendingCancellation { .. }
    ));
    assert_eq!(cancelled.plan_id, premium.id);
    assert_eq!(h.user("u1").await.credits, credits);

    let again = h.util.cancel_subscription("u1", false).await.unwrap();
    assert_eq!(again, cancelled);
    assert_eq!(h.sender.events_for("u1"), vec!["new", "pending_cancellation"]);
}

#[tokio::test]
async fn payment_intent_carries_the_plan() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;

    let checkout = h
        .util
        .create_stripe_payment_intent("u1", &premium.id)
        .await
        .unwrap();
    assert_eq!(checkout.amount_cents, 999);
    assert_eq!(checkout.client_secret, "pi_scripted_secret");

    let intents = h.storefront.payment_intents.lock().unwrap().clone();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].1["userId"], "u1");
    assert_eq!(intents[0].1["planId"], premium.id.to_string());

    let free = h
        .util
        .list_plans()
        .await
        .unwrap()
        .into_iter()
        .find(|plan| plan.plan_type == PlanType::Free)
        .unwrap();
    let err = h
        .util
        .create_stripe_payment_intent("u1", &free.id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)));
}

#[tokio::test]
async fn payment_intent_pays_for_one_plan_only() {
    let h = harness().await;
    h.add_user("u1").await;
    let basic = h.add_plan("Basic", PlanType::Basic, 0.99, 10).await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 1000).await;
    h.util
        .subscribe("u1", &basic.id, &h.paid(&basic, "pi_cheap"))
        .await
        .unwrap();
    let credits = h.user("u1").await.credits;

    let err = h
        .util
        .subscribe("u1", &premium.id, &stripe("pi_cheap"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VerificationFailed(_)));
    let user = h.user("u1").await;
    assert_eq!(user.membership.plan_type, PlanType::Basic);
    assert_eq!(user.credits, credits);
    assert_eq!(h.store.payment_records_for_user("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn underpaid_intent_is_rejected() {
    let h = harness().await;
    h.add_user("u1").await;
    let premium = h.add_plan("Premium", PlanType::Premium, 9.99, 100).await;
    h.storefront
        .stripe_intent("pi_short", 99, &premium.id.to_string());

    let err = h
        .util
        .subscribe("u1", &premium.id, &stripe("pi_short"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VerificationFailed(_)));
    assert!(h.user("u1").await.is_on_free_plan());
}

#[tokio::test]
async fn replay_after_cleanup_is_still_recognised() {
    let h = harness().await;
    h.add_user("u1").await;
    let basic = h.add_plan("Basic", PlanType::Basic, 0.99, 10).await;
    let request = h.paid(&basic, "pi_cheap");
    h.util.subscribe("u1", &basic.id, &request).await.unwrap();
    let credits = h.user("u1").await.credits;

    h.util.cleanup().await.unwrap();
    let replay = h.util.subscribe("u1", &basic.id, &request).await.unwrap();
    assert_eq!(replay.message, "Already subscribed");
    assert_eq!(replay.change, None);
    assert_eq!(h.user("u1").await.credits, credits);
}

#[tokio::test]
async fn google_token_replay_after_renewal_changes_nothing() {
    let h = harness().await;
    h.add_user("u1").await;
    let standard = h.add_plan("Standard", PlanType::Standard, 5.99, 100).await;
    let request = google(&standard, "tok-renewing");
    h.storefront.verdict(
        "tok-renewing",
        VerificationResult {
            expires_date: Some(start() + Duration::days(30)),
            ..VerificationResult::verified("GPA.1")
        },
    );
    h.util.subscribe("u1", &standard.id, &request).await.unwrap();
    h.util
        .record_generation_usage("u1", GenerationType::Prompt, 10)
        .await
        .unwrap();
    let credits = h.user("u1").await.credits;

    h.clock.advance(Duration::days(30));
    h.storefront.verdict(
        "tok-renewing",
        VerificationResult {
            expires_date: Some(start() + Duration::days(60)),
            ..VerificationResult::verified("GPA.1..0")
        },
    );
    let replay = h.util.subscribe("u1", &standard.id, &request).await.unwrap();
    assert_eq!(replay.message, "Already subscribed");
    assert_eq!(replay.change, None);
    assert_eq!(h.user("u1").await.credits, credits);
    assert_eq!(h.store.payment_records_for_user("u1").await.unwrap().len(), 1);
}
