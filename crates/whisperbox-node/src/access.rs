//! Who may respond to a form.

use std::sync::Arc;

use async_trait::async_trait;
use whisperbox_nft_client::NftClient;
use whisperbox_protocol::{
    form::{Form, WhitelistMode},
    signature::addresses_match,
};

/// Answers "does `address` hold an asset of `contract`".
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    async fn owns_asset(&self, address: &str, contract: &str) -> anyhow::Result<bool>;
}

#[async_trait]
impl OwnershipOracle for NftClient {
    async fn owns_asset(&self, address: &str, contract: &str) -> anyhow::Result<bool> {
        Ok(NftClient::owns_asset(self, address, contract).await?)
    }
}

/// Oracle used when no NFT RPC endpoint is configured. Every query fails,
/// so NFT-gated forms deny everyone but their creator.
pub struct UnconfiguredOracle;

#[async_trait]
impl OwnershipOracle for UnconfiguredOracle {
    async fn owns_asset(&self, _address: &str, _contract: &str) -> anyhow::Result<bool> {
        anyhow::bail!("no NFT oracle configured")
    }
}

#[derive(Clone)]
pub struct AccessEvaluator {
    oracle: Arc<dyn OwnershipOracle>,
}

impl AccessEvaluator {
    pub fn new(oracle: Arc<dyn OwnershipOracle>) -> Self {
        Self { oracle }
    }

    pub async fn can_access(&self, form: &Form, address: Option<&str>) -> bool {
        let Some(address) = address.filter(|a| !a.is_empty()) else {
            return false;
        };
        if form.is_created_by(address) {
            return true;
        }
        match form.whitelist.mode {
            WhitelistMode::Open => true,
            WhitelistMode::Nft => {
                match self.oracle.owns_asset(address, form.whitelist.value.trim()).await {
                    Ok(owns) => owns,
                    Err(e) => {
                        tracing::warn!(form = %form.id, "Ownership check for {address} failed: {e}");
                        false
                    }
                }
            }
            WhitelistMode::Addresses => form.whitelist.allowed_addresses().any(|a| addresses_match(a, address)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{evaluator, StaticOracle};
    use super::*;
    use whisperbox_protocol::form::{FormDraft, Question, QuestionKind, Whitelist};

    fn form(whitelist: Whitelist) -> Form {
        FormDraft {
            title: "Poll".into(),
            description: String::new(),
            questions: vec![Question {
                id: "q1".into(),
                kind: QuestionKind::Text,
                text: "Why?".into(),
                required: false,
                options: vec![],
            }],
            whitelist,
        }
        .into_form("0xC1".into(), 1_700_000_000_000, "00".repeat(32))
    }

    #[tokio::test]
    async fn missing_address_denied() {
        let access = evaluator(StaticOracle::default());
        assert!(!access.can_access(&form(Whitelist::open()), None).await);
        assert!(!access.can_access(&form(Whitelist::open()), Some("")).await);
    }

    #[tokio::test]
    async fn open_forms_admit_anyone() {
        let access = evaluator(StaticOracle::default());
        assert!(access.can_access(&form(Whitelist::open()), Some("0xR1")).await);
    }

    #[tokio::test]
    async fn address_list_is_case_insensitive_and_trimmed() {
        let access = evaluator(StaticOracle::default());
        let f = form(Whitelist { mode: WhitelistMode::Addresses, value: "0xAAA, 0xBBB".into() });
        assert!(access.can_access(&f, Some("0xaaa")).await);
        assert!(access.can_access(&f, Some("0xBBB")).await);
        assert!(!access.can_access(&f, Some("0xCCC")).await);
        assert!(access.can_access(&f, Some("0xc1")).await);
    }

    #[tokio::test]
    async fn nft_gate_asks_the_oracle() {
        let f = form(Whitelist::nft("0xNFT"));
        let access = evaluator(StaticOracle::holding("0xR1", "0xnft"));
        assert!(access.can_access(&f, Some("0xr1")).await);
        assert!(!access.can_access(&f, Some("0xR2")).await);
    }

    #[tokio::test]
    async fn oracle_failure_denies_but_creator_passes() {
        let f = form(Whitelist::nft("0xNFT"));
        let access = evaluator(StaticOracle::failing());
        assert!(!access.can_access(&f, Some("0xR1")).await);
        assert!(access.can_access(&f, Some("0xC1")).await);
    }

    #[tokio::test]
    async fn unconfigured_oracle_denies() {
        let access = AccessEvaluator::new(Arc::new(UnconfiguredOracle));
        assert!(!access.can_access(&form(Whitelist::nft("0xNFT")), Some("0xR1")).await);
    }
}
