use anyhow::Result;
use bitcoin::Network;
use bitcoin::hashes::Hash as _;
use lightning_invoice::{Bolt11Invoice, Currency};
use std::str::FromStr as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInvoice {
    pub payment_hash: String,
    pub amount_msat: Option<u64>,
    /// Unix seconds.
    pub expires_at: u64,
    pub min_final_cltv_expiry_delta: u64,
}

pub fn parse_bolt11(invoice: &str, network: Network) -> Result<ParsedInvoice> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    anyhow::ensure!(
        invoice.currency() == Currency::from(network),
        "invoice is not for {network}"
    );
    let expires_at = invoice
        .duration_since_epoch()
        .saturating_add(invoice.expiry_time())
        .as_secs();
    Ok(ParsedInvoice {
        payment_hash: hex::encode(invoice.payment_hash().to_byte_array()),
        amount_msat: invoice.amount_milli_satoshis(),
        expires_at,
        min_final_cltv_expiry_delta: invoice.min_final_cltv_expiry_delta(),
    })
}

pub fn payment_hash_from_bolt11(invoice: &str) -> Result<[u8; 32]> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(invoice.payment_hash().to_byte_array())
}

/// Hex `sha256(secret)`; fails on a malformed secret.
pub fn payment_hash_of_secret(secret_hex: &str) -> Result<String> {
    let secret = hex::decode(secret_hex).map_err(|e| anyhow::anyhow!("decode secret: {e}"))?;
    anyhow::ensure!(secret.len() == 32, "secret must be 32 bytes");
    Ok(hex::encode(
        bitcoin::hashes::sha256::Hash::hash(&secret).to_byte_array(),
    ))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hash_amount_and_expiry() {
        let invoice = test_utils::signed_invoice([9u8; 32], 250_000, 1_700_000_000, 600);
        let parsed = parse_bolt11(&invoice, Network::Bitcoin).unwrap();
        assert_eq!(parsed.payment_hash, hex::encode([9u8; 32]));
        assert_eq!(parsed.amount_msat, Some(250_000));
        assert_eq!(parsed.expires_at, 1_700_000_600);
        assert_eq!(payment_hash_from_bolt11(&invoice).unwrap(), [9u8; 32]);
    }

    #[test]
    fn rejects_wrong_network_and_garbage() {
        let invoice = test_utils::signed_invoice([9u8; 32], 250_000, 1_700_000_000, 600);
        assert!(parse_bolt11(&invoice, Network::Testnet).is_err());
        assert!(parse_bolt11("lnbc1garbage", Network::Bitcoin).is_err());
    }

    #[test]
    fn secret_hash_matches() {
        let secret = hex::encode([1u8; 32]);
        let hash = payment_hash_of_secret(&secret).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(payment_hash_of_secret("abcd").is_err());
    }
}
