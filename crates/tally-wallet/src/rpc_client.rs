use anyhow::{bail, Context};

use tally_core::{
    AccountConfirmation, AllocateSigNumRequest, AllocateSigNumResponse, BalanceAgreement,
    BalanceAgreementReply, Identity, PostTransactionRequest, SignatureLine, Transaction,
};
use tally_rpc::{RpcAccount, RpcBalance};

/// Simple JSON-RPC 2.0 client used by the wallet to talk to a running node.
///
/// Raw HTTP POST with serde_json rather than the full jsonrpsee client keeps
/// the wallet binary lean.
pub struct WalletRpcClient {
    url: String,
    client: reqwest::Client,
}

impl WalletRpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Call a JSON-RPC method and return the `result` field.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("connecting to node at {}", self.url))?;

        let json: serde_json::Value = resp.json().await.context("parsing RPC response")?;

        if let Some(err) = json.get("error") {
            bail!("RPC error: {}", err);
        }

        Ok(json["result"].clone())
    }

    pub async fn get_account(&self, account_id: &str) -> anyhow::Result<Option<RpcAccount>> {
        let result = self
            .call("tally_getAccount", serde_json::json!([account_id]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result).context("parsing account")
    }

    pub async fn get_balance(&self, account_id: &str) -> anyhow::Result<RpcBalance> {
        let result = self
            .call("tally_getBalance", serde_json::json!([account_id]))
            .await?;
        serde_json::from_value(result).context("parsing balance")
    }

    pub async fn get_identity(&self, identity_id: &str) -> anyhow::Result<Option<Identity>> {
        let result = self
            .call("tally_getIdentity", serde_json::json!([identity_id]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result).context("parsing identity")
    }

    pub async fn get_transaction(&self, trx_id: &str) -> anyhow::Result<Option<Transaction>> {
        let result = self
            .call("tally_getTransaction", serde_json::json!([trx_id]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Transaction::from_json(&result).map(Some).map_err(Into::into)
    }

    pub async fn register_identity(&self, identity: &Identity) -> anyhow::Result<()> {
        self.call("tally_registerIdentity", serde_json::json!([identity]))
            .await?;
        Ok(())
    }

    pub async fn post_transaction(&self, req: &PostTransactionRequest) -> anyhow::Result<()> {
        self.call("tally_postTransaction", serde_json::json!([req]))
            .await?;
        Ok(())
    }

    pub async fn sign_transaction(
        &self,
        trx_id: &str,
        line: &SignatureLine,
    ) -> anyhow::Result<()> {
        self.call("tally_signTransaction", serde_json::json!([trx_id, line]))
            .await?;
        Ok(())
    }

    pub async fn allocate_signature_numbers(
        &self,
        req: &AllocateSigNumRequest,
    ) -> anyhow::Result<AllocateSigNumResponse> {
        let result = self
            .call("tally_allocateSignatureNumbers", serde_json::json!([req]))
            .await?;
        serde_json::from_value(result).context("parsing allocation response")
    }

    pub async fn confirm_account(&self, c: &AccountConfirmation) -> anyhow::Result<bool> {
        let result = self
            .call("tally_confirmAccount", serde_json::json!([c]))
            .await?;
        result.as_bool().context("expected bool from confirmAccount")
    }

    pub async fn balance_agreement(
        &self,
        ba: &BalanceAgreement,
    ) -> anyhow::Result<BalanceAgreementReply> {
        let result = self
            .call("tally_balanceAgreement", serde_json::json!([ba]))
            .await?;
        serde_json::from_value(result).context("parsing balance agreement reply")
    }
}
