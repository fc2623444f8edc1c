use std::time::Duration;

use anyhow::{Context as _, Result};

use swap_intermediary::abort::AbortSignal;
use swap_intermediary::chain::{ChainEvent, CommitStatus};
use swap_intermediary::engine::{self, EscrowHandler as _};
use swap_intermediary::error::codes;
use swap_intermediary::handlers::{FromBtcLnHandler, FromBtcLnQuote, FromBtcLnQuoteRequest};
use swap_intermediary::lightning::InvoiceState;
use swap_intermediary::swap::{FromBtcLnState, SwapId, SwapState as _, unix_time};

mod support {
    pub mod fixture;
    pub mod mocks;
}

use support::fixture::{Harness, secret};
use support::mocks::{CHAIN, LP_ADDRESS, TOKEN};

const AMOUNT_SATS: u64 = 100_000;

async fn quote(handler: &FromBtcLnHandler, hash: &str) -> Result<(FromBtcLnQuote, SwapId)> {
    let request = FromBtcLnQuoteRequest {
        chain_id: None,
        token: TOKEN.to_string(),
        claimer: "user".to_string(),
        payment_hash: hash.to_string(),
        amount: u128::from(AMOUNT_SATS),
        exact_in: true,
        description: "swap".to_string(),
    };
    let quote = handler.create_quote(request, &AbortSignal::never()).await?;
    let id = quote.id.parse()?;
    Ok((quote, id))
}

/// Holds a payment whose HTLC times out in about a day.
fn hold(h: &Harness, hash: &str) {
    h.lightning.hold(hash, AMOUNT_SATS * 1000, unix_time() + 144 * 600);
}

#[tokio::test]
async fn held_payment_is_settled_after_user_claims() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (secret, hash) = secret(1)?;
    let (quote, id) = quote(&handler, &hash).await?;

    assert_eq!(quote.amount, u128::from(AMOUNT_SATS));
    assert_eq!(quote.total, (100_000 - 400) * 10);
    assert!(quote.security_deposit >= 10_000);
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Unpaid));
    assert_eq!(id.sequence, None);

    let err = handler
        .authorize_payment(&id, &AbortSignal::never())
        .await
        .expect_err("nothing held yet");
    assert_eq!(err.code(), codes::INVALID_REQUEST);

    hold(&h, &hash);
    let auth = handler.authorize_payment(&id, &AbortSignal::never()).await?;
    assert_eq!(auth.escrow.claim_hash, hash);
    assert_eq!(auth.escrow.offerer, LP_ADDRESS);
    assert_eq!(auth.escrow.amount, quote.total);
    assert_eq!(auth.escrow.security_deposit, quote.security_deposit);
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Received.code());

    let again = handler.authorize_payment(&id, &AbortSignal::never()).await?;
    assert_eq!(again, auth);
    assert_eq!(h.contract.init_signatures(), 1);

    let init = h.contract.commit(&auth.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Commited.code());

    let claim = h.contract.user_claim(&auth.escrow, &secret);
    engine::dispatch_event(handler.as_ref(), CHAIN, &claim).await;
    assert_eq!(h.lightning.settled(), vec![hash.clone()]);
    assert!(handler.get_status(&id).await.is_err());

    engine::dispatch_event(handler.as_ref(), CHAIN, &claim).await;
    assert_eq!(h.lightning.settled().len(), 1);
    Ok(())
}

#[tokio::test]
async fn settles_from_revealed_secret_without_events() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (secret, hash) = secret(2)?;
    let (_, id) = quote(&handler, &hash).await?;
    hold(&h, &hash);
    let auth = handler.authorize_payment(&id, &AbortSignal::never()).await?;

    // Both the initialize and the claim events are missed.
    h.contract.commit(&auth.escrow);
    engine::reconcile(handler.as_ref()).await?;
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Commited.code());

    h.contract.user_claim(&auth.escrow, &secret);
    engine::reconcile(handler.as_ref()).await?;
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Settled));
    assert!(handler.get_status(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn refunds_expired_escrow_and_releases_htlc() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (_, hash) = secret(3)?;
    let (_, id) = quote(&handler, &hash).await?;
    hold(&h, &hash);
    let auth = handler.authorize_payment(&id, &AbortSignal::never()).await?;
    let init = h.contract.commit(&auth.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;

    h.contract.set_status(&auth.escrow, CommitStatus::Refundable);
    let report = engine::reconcile(handler.as_ref()).await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(h.contract.refunds().len(), 1);
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Canceled));
    assert!(h.lightning.settled().is_empty());
    assert!(handler.get_status(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn short_htlc_is_canceled_instead_of_escrowed() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;

    // Escrow would expire before the authorization does.
    let (_, hash) = secret(4)?;
    let (_, id) = quote(&handler, &hash).await?;
    h.lightning.hold(&hash, AMOUNT_SATS * 1000, unix_time() + 3_700);
    let err = handler
        .authorize_payment(&id, &AbortSignal::never())
        .await
        .expect_err("HTLC too short");
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Canceled));
    assert!(handler.get_status(&id).await.is_err());
    assert_eq!(h.contract.init_signatures(), 0);

    // Same, found by the watchdog.
    let (_, hash) = secret(5)?;
    let (_, id) = quote(&handler, &hash).await?;
    h.lightning.hold(&hash, AMOUNT_SATS * 1000, unix_time() + 3_700);
    let report = engine::reconcile(handler.as_ref()).await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Canceled));
    assert!(handler.get_status(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn underpaid_htlc_is_not_authorized() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (_, hash) = secret(6)?;
    let (_, id) = quote(&handler, &hash).await?;

    h.lightning.hold(&hash, AMOUNT_SATS * 1000 - 1, unix_time() + 144 * 600);
    let err = handler
        .authorize_payment(&id, &AbortSignal::never())
        .await
        .expect_err("held amount too small");
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Created.code());
    Ok(())
}

#[tokio::test]
async fn rejects_bad_payment_hash_and_duplicates() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;

    let err = quote(&handler, "not-a-hash").await.expect_err("malformed hash");
    let err = err.downcast::<swap_intermediary::error::SwapError>()?;
    assert_eq!(err.code(), codes::INVALID_REQUEST);

    let (_, hash) = secret(7)?;
    quote(&handler, &hash).await?;
    let err = quote(&handler, &hash.to_ascii_uppercase())
        .await
        .expect_err("same hash twice");
    let err = err.downcast::<swap_intermediary::error::SwapError>()?;
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    Ok(())
}

#[tokio::test]
async fn locked_swap_is_not_canceled_by_watchdog() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (_, hash) = secret(8)?;
    let (_, id) = quote(&handler, &hash).await?;
    hold(&h, &hash);
    let auth = handler.authorize_payment(&id, &AbortSignal::never()).await?;
    h.contract.set_status(&auth.escrow, CommitStatus::Expired);

    let swap = handler.engine().get(&id).context("swap not loaded")?;
    let guard = swap
        .try_lock(Duration::from_secs(30))
        .context("swap already locked")?;
    let report = engine::reconcile(handler.as_ref()).await?;
    assert_eq!(report.advanced, 0);
    assert!(h.lightning.canceled().is_empty());
    assert!(matches!(h.lightning.invoice(&hash), Some(InvoiceState::Held { .. })));
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Received.code());

    drop(guard);
    let report = engine::reconcile(handler.as_ref()).await?;
    assert_eq!(report.advanced, 1);
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Canceled));
    assert!(handler.get_status(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn locked_swap_is_not_authorized_or_refunded() -> Result<()> {
    let h = Harness::new();
    let handler = h.from_btc_ln()?;
    let (_, hash) = secret(9)?;
    let (_, id) = quote(&handler, &hash).await?;
    hold(&h, &hash);

    let swap = handler.engine().get(&id).context("swap not loaded")?;
    let guard = swap
        .try_lock(Duration::from_secs(30))
        .context("swap already locked")?;
    let err = handler
        .authorize_payment(&id, &AbortSignal::never())
        .await
        .expect_err("swap is locked");
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    assert_eq!(h.contract.init_signatures(), 0);
    drop(guard);

    let auth = handler.authorize_payment(&id, &AbortSignal::never()).await?;
    let guard = swap
        .try_lock(Duration::from_secs(30))
        .context("swap already locked")?;
    let err = handler
        .authorize_payment(&id, &AbortSignal::never())
        .await
        .expect_err("re-authorization while locked");
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    drop(guard);

    let init = h.contract.commit(&auth.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Commited.code());

    // A refund seen while another task owns the swap is left for a later pass.
    let refund = ChainEvent::Refund {
        escrow_hash: auth.escrow.escrow_hash(),
        txid: "user-refund".to_string(),
    };
    let guard = swap
        .try_lock(Duration::from_secs(30))
        .context("swap already locked")?;
    engine::dispatch_event(handler.as_ref(), CHAIN, &refund).await;
    assert_eq!(handler.get_status(&id).await?.state, FromBtcLnState::Commited.code());
    assert!(h.lightning.canceled().is_empty());

    drop(guard);
    engine::dispatch_event(handler.as_ref(), CHAIN, &refund).await;
    assert_eq!(h.lightning.invoice(&hash), Some(InvoiceState::Canceled));
    assert!(handler.get_status(&id).await.is_err());
    Ok(())
}
