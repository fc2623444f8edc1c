use anyhow::Result;

use swap_intermediary::abort::AbortSignal;
use swap_intermediary::chain::CommitStatus;
use swap_intermediary::engine::{self, EscrowHandler as _};
use swap_intermediary::error::codes;
use swap_intermediary::handlers::{ToBtcLnHandler, ToBtcLnQuote, ToBtcLnQuoteRequest};
use swap_intermediary::lightning::PaymentStatus;
use swap_intermediary::storage::SwapStorage as _;
use swap_intermediary::swap::{SwapDirection, SwapId, SwapState as _, ToBtcLnState};

mod support {
    pub mod fixture;
    pub mod mocks;
}

use support::fixture::{Harness, secret, signed_invoice};
use support::mocks::{CHAIN, PayOutcome, TOKEN};

const AMOUNT_SATS: u64 = 50_000;

fn request(bolt11: String) -> ToBtcLnQuoteRequest {
    ToBtcLnQuoteRequest {
        chain_id: None,
        token: TOKEN.to_string(),
        offerer: "user".to_string(),
        bolt11,
    }
}

async fn quote(h: &Harness, handler: &ToBtcLnHandler, byte: u8) -> Result<(ToBtcLnQuote, SwapId, String)> {
    let (secret, hash) = secret(byte)?;
    h.lightning.learn_preimage(&secret)?;
    let bolt11 = signed_invoice(&hash, AMOUNT_SATS * 1000, 3600)?;
    let quote = handler.create_quote(request(bolt11), &AbortSignal::never()).await?;
    let id = quote.id.parse()?;
    Ok((quote, id, secret))
}

#[tokio::test]
async fn pays_invoice_and_claims_with_preimage() -> Result<()> {
    let h = Harness::new();
    let handler = h.to_btc_ln()?;
    let (quote, id, _) = quote(&h, &handler, 1).await?;

    // max(10, 0.2%) routing budget, 100 + 0.3% swap fee
    assert_eq!(quote.amount, 50_000);
    assert_eq!(quote.max_fee, 100);
    assert_eq!(quote.swap_fee, 250);
    assert_eq!(quote.total, (50_000 + 250 + 100) * 10);
    assert_eq!(quote.escrow.claim_hash, id.hash);
    assert_eq!(id.sequence, None);

    let init = h.contract.commit(&quote.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;

    assert_eq!(h.lightning.pays(), 1);
    assert_eq!(h.contract.claims(), vec![quote.escrow.escrow_hash()]);
    assert!(handler.get_status(&id).await.is_err());

    // Replayed initialize for the closed swap.
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;
    assert_eq!(h.lightning.pays(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_payment_becomes_refundable() -> Result<()> {
    let h = Harness::new();
    let handler = h.to_btc_ln()?;
    let (quote, id, _) = quote(&h, &handler, 2).await?;

    h.lightning.set_outcome(PayOutcome::Fail("no route".to_string()));
    let init = h.contract.commit(&quote.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;
    assert_eq!(handler.get_status(&id).await?.state, ToBtcLnState::NonPayable.code());

    let refund = handler.get_refund_authorization(&id).await?;
    assert_eq!(refund.prefix, "refund");

    // Refund authorization handed out: the payment is never retried.
    engine::reconcile(handler.as_ref()).await?;
    assert_eq!(h.lightning.pays(), 1);

    h.contract.set_status(&quote.escrow, CommitStatus::NotCommitted);
    engine::reconcile(handler.as_ref()).await?;
    assert!(h.storage.is_empty());
    Ok(())
}

#[tokio::test]
async fn pending_payment_resolves_in_background_check() -> Result<()> {
    let h = Harness::new();
    let handler = h.to_btc_ln()?;
    let (quote, id, secret) = quote(&h, &handler, 3).await?;

    h.lightning.set_outcome(PayOutcome::Hang);
    let init = h.contract.commit(&quote.escrow);
    engine::dispatch_event(handler.as_ref(), CHAIN, &init).await;
    assert_eq!(handler.get_status(&id).await?.state, ToBtcLnState::Commited.code());
    assert_eq!(handler.check_payments().await?, 0);

    h.lightning.set_payment(
        &id.hash,
        PaymentStatus::Succeeded {
            secret: secret.clone(),
            fee_msat: 700,
        },
    );
    assert_eq!(handler.check_payments().await?, 1);
    assert!(handler.get_status(&id).await.is_err());
    assert_eq!(h.lightning.pays(), 1);
    assert_eq!(h.contract.claims().len(), 1);
    Ok(())
}

#[tokio::test]
async fn never_pays_twice_after_restart() -> Result<()> {
    let h = Harness::new();
    let handler = h.to_btc_ln()?;
    let (quote, id, secret) = quote(&h, &handler, 4).await?;

    // The payment went out before a crash; the initialize event was missed.
    h.lightning.set_payment(&id.hash, PaymentStatus::Succeeded { secret, fee_msat: 0 });
    h.contract.set_status(&quote.escrow, CommitStatus::Committed);
    drop(handler);

    let restarted = h.to_btc_ln()?;
    restarted.engine().load().await?;
    let report = engine::reconcile(restarted.as_ref()).await?;
    assert_eq!(report.failed, 0);
    assert_eq!(h.lightning.pays(), 0);
    assert_eq!(h.contract.claims().len(), 1);
    assert!(h.storage.get(SwapDirection::ToBtcLn, &id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn rejects_unusable_invoices() -> Result<()> {
    let h = Harness::new();
    let handler = h.to_btc_ln()?;
    let never = AbortSignal::never();

    let err = handler
        .create_quote(request("lnbc1garbage".to_string()), &never)
        .await
        .expect_err("not an invoice");
    assert_eq!(err.code(), codes::INVALID_INVOICE);

    let (_, hash) = secret(5)?;
    let short = signed_invoice(&hash, AMOUNT_SATS * 1000, 60)?;
    let err = handler
        .create_quote(request(short), &never)
        .await
        .expect_err("expires too soon");
    assert_eq!(err.code(), codes::INVALID_INVOICE);

    h.lightning.set_route_fee(None);
    let ok = signed_invoice(&hash, AMOUNT_SATS * 1000, 3600)?;
    let err = handler
        .create_quote(request(ok.clone()), &never)
        .await
        .expect_err("no route");
    assert_eq!(err.code(), codes::INSUFFICIENT_LIQUIDITY);

    h.lightning.set_route_fee(Some(1_000));
    h.lightning.set_outbound(1_000);
    let err = handler
        .create_quote(request(ok.clone()), &never)
        .await
        .expect_err("not enough outbound capacity");
    assert_eq!(err.code(), codes::INSUFFICIENT_LIQUIDITY);

    h.lightning.set_outbound(100_000_000);
    handler.create_quote(request(ok.clone()), &never).await?;
    let err = handler
        .create_quote(request(ok), &never)
        .await
        .expect_err("duplicate payment hash");
    assert_eq!(err.code(), codes::INVALID_REQUEST);
    Ok(())
}
