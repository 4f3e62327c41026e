use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use tally_core::{
    Account, AccountConfirmation, AllocateSigNumRequest, AllocateSigNumResponse, BalanceAgreement,
    BalanceAgreementReply, Identity, PostTransactionRequest, SignatureLine, TallyError,
    Transaction,
};
use tally_crypto::Digest;
use tally_market::Market;
use tally_state::LedgerEngine;

use crate::api::TallyApiServer;
use crate::types::{
    RpcAccount, RpcAssetNote, RpcBalance, RpcIdentity, RpcOrderRequest, RpcOrderResult, RpcTrade,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

fn ledger_err(e: TallyError) -> ErrorObject<'static> {
    rpc_err(-32603, e.to_string())
}

fn parse_digest(s: &str, what: &str) -> Result<Digest, ErrorObject<'static>> {
    Digest::from_hex(s).map_err(|e| rpc_err(-32602, format!("invalid {what}: {e}")))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub engine: Arc<LedgerEngine>,
    pub market: Arc<Market>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

// ── Internal helper: project an Account onto its RPC shape ───────────────────

fn account_to_rpc(
    engine: &LedgerEngine,
    account: Account,
    applied_balance: i64,
    pending_balance: i64,
) -> RpcAccount {
    let owner_signed = engine
        .get_identity(account.owner())
        .map(|owner| account.owner_signed(&owner))
        .unwrap_or(false);
    let host_signed = account.host_signed(engine.host_identity());

    RpcAccount {
        account_id: account.id().to_hex(),
        host: account.host().to_hex(),
        owner: account.owner().to_hex(),
        note_type: account.note_type().to_hex(),
        balance: account.balance(),
        balance_date: account.balance_date(),
        applied_balance,
        pending_balance,
        reserved_sig_ids: account.reserved_sig_ids().to_vec(),
        new_sig_ids: account.new_sig_ids().to_vec(),
        owner_signed,
        host_signed,
        in_box: account.in_box().iter().map(|d| d.to_hex()).collect(),
        out_box: account.out_box().iter().map(|d| d.to_hex()).collect(),
        applied: account.applied().iter().map(|d| d.to_hex()).collect(),
    }
}

// ── RPC implementation ───────────────────────────────────────────────────────

#[async_trait]
impl TallyApiServer for RpcServer {
    async fn allocate_signature_numbers(
        &self,
        req: AllocateSigNumRequest,
    ) -> RpcResult<AllocateSigNumResponse> {
        self.state
            .engine
            .allocate_signature_numbers(&req, now_us())
            .map_err(|e| ledger_err(e).into())
    }

    async fn confirm_account(&self, confirmation: AccountConfirmation) -> RpcResult<bool> {
        self.state
            .engine
            .confirm_account(&confirmation)
            .map_err(|e| ledger_err(e).into())
    }

    async fn post_transaction(&self, req: PostTransactionRequest) -> RpcResult<bool> {
        self.state
            .engine
            .post_transaction(&req.transaction, now_ms())
            .map(|_| true)
            .map_err(|e| ledger_err(e).into())
    }

    async fn sign_transaction(&self, trx_id: String, line: SignatureLine) -> RpcResult<bool> {
        let id = parse_digest(&trx_id, "transaction id")?;
        self.state
            .engine
            .update_signature(&id, line)
            .map(|_| true)
            .map_err(|e| ledger_err(e).into())
    }

    async fn balance_agreement(&self, ba: BalanceAgreement) -> RpcResult<BalanceAgreementReply> {
        self.state
            .engine
            .host_accept_balance(&ba, now_ms())
            .map_err(|e| ledger_err(e).into())
    }

    async fn register_identity(&self, identity: Identity) -> RpcResult<bool> {
        self.state
            .engine
            .register_identity(identity)
            .map(|_| true)
            .map_err(|e| ledger_err(e).into())
    }

    async fn create_identity(&self, name: String, properties: String) -> RpcResult<String> {
        self.state
            .engine
            .create_identity(&name, &properties, now_us())
            .map(|id| id.to_hex())
            .map_err(|e| ledger_err(e).into())
    }

    async fn create_account(&self, owner_id: String, note_id: String) -> RpcResult<String> {
        let owner = parse_digest(&owner_id, "owner id")?;
        let note = parse_digest(&note_id, "note id")?;
        self.state
            .engine
            .create_account(&owner, &note, now_ms())
            .map(|a| a.id().to_hex())
            .map_err(|e| ledger_err(e).into())
    }

    async fn get_account(&self, account_id: String) -> RpcResult<Option<RpcAccount>> {
        let id = parse_digest(&account_id, "account id")?;
        match self.state.engine.account_view(&id) {
            Ok((account, applied, pending)) => Ok(Some(account_to_rpc(
                &self.state.engine,
                account,
                applied,
                pending,
            ))),
            Err(TallyError::UnknownEntity { .. }) => Ok(None),
            Err(e) => Err(ledger_err(e).into()),
        }
    }

    async fn get_balance(&self, account_id: String) -> RpcResult<RpcBalance> {
        let id = parse_digest(&account_id, "account id")?;
        let (account, applied_balance, pending_balance) = self
            .state
            .engine
            .account_view(&id)
            .map_err(|e| ledger_err(e))?;
        Ok(RpcBalance {
            balance: account.balance(),
            applied_balance,
            pending_balance,
        })
    }

    async fn get_transaction(&self, trx_id: String) -> RpcResult<Option<Transaction>> {
        let id = parse_digest(&trx_id, "transaction id")?;
        match self.state.engine.get_transaction(&id) {
            Ok(trx) => Ok(Some(trx)),
            Err(TallyError::UnknownEntity { .. }) => Ok(None),
            Err(e) => Err(ledger_err(e).into()),
        }
    }

    async fn get_identities(&self) -> RpcResult<Vec<RpcIdentity>> {
        let identities = self.state.engine.identities().map_err(ledger_err)?;
        Ok(identities
            .into_iter()
            .map(|i| RpcIdentity {
                id: i.id().to_hex(),
                name: i.name().to_string(),
                date: i.date(),
                properties: i.properties().to_string(),
                nonce: i.nonce(),
            })
            .collect())
    }

    async fn get_identity(&self, identity_id: String) -> RpcResult<Option<Identity>> {
        let id = parse_digest(&identity_id, "identity id")?;
        match self.state.engine.get_identity(&id) {
            Ok(ident) => Ok(Some(ident)),
            Err(TallyError::UnknownEntity { .. }) => Ok(None),
            Err(e) => Err(ledger_err(e).into()),
        }
    }

    async fn get_asset_notes(&self) -> RpcResult<Vec<RpcAssetNote>> {
        let notes = self.state.engine.asset_notes().map_err(ledger_err)?;
        Ok(notes
            .into_iter()
            .map(|n| RpcAssetNote {
                id: n.id().to_hex(),
                issuer: n.issuer().to_hex(),
                asset: n.asset().to_hex(),
                name: n.name().to_string(),
                properties: n.properties().to_string(),
            })
            .collect())
    }

    async fn get_accounts(&self) -> RpcResult<Vec<String>> {
        let accounts = self.state.engine.accounts().map_err(ledger_err)?;
        Ok(accounts.into_iter().map(|a| a.id().to_hex()).collect())
    }

    async fn submit_order(&self, req: RpcOrderRequest) -> RpcResult<RpcOrderResult> {
        let stock = parse_digest(&req.stock_account, "stock account")?;
        let currency = parse_digest(&req.currency_account, "currency account")?;

        let (order_trx, trades) = self
            .state
            .market
            .place_order(
                req.side,
                &stock,
                &currency,
                req.amount,
                req.price,
                req.min_unit,
                req.start,
                req.end,
                now_ms(),
            )
            .map_err(|e| rpc_err(-32603, e.to_string()))?;

        Ok(RpcOrderResult {
            order_trx: order_trx.to_hex(),
            trades: trades
                .into_iter()
                .map(|t| RpcTrade {
                    buy_trx: t.buy_trx.to_hex(),
                    sell_trx: t.sell_trx.to_hex(),
                    fill_trx: t.fill_trx.to_hex(),
                    amount: t.amount,
                    price: t.price,
                    timestamp: t.timestamp,
                })
                .collect(),
        })
    }
}
