use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use tally_core::{
    AccountConfirmation, AllocateSigNumRequest, AllocateSigNumResponse, BalanceAgreement,
    BalanceAgreementReply, Identity, PostTransactionRequest, SignatureLine, Transaction,
};

use crate::types::{
    RpcAccount, RpcAssetNote, RpcBalance, RpcIdentity, RpcOrderRequest, RpcOrderResult,
};

/// Tally JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "tally_" via `namespace = "tally"`.
#[rpc(server, namespace = "tally")]
pub trait TallyApi {
    // ── Protocol operations ──────────────────────────────────────────────────

    /// Issue a batch of single-use signature numbers for an account.
    #[method(name = "allocateSignatureNumbers")]
    async fn allocate_signature_numbers(
        &self,
        req: AllocateSigNumRequest,
    ) -> RpcResult<AllocateSigNumResponse>;

    /// Owner counter-signs the current account digest.
    #[method(name = "confirmAccount")]
    async fn confirm_account(&self, confirmation: AccountConfirmation) -> RpcResult<bool>;

    /// Post a transaction to every required signer's inbox.
    #[method(name = "postTransaction")]
    async fn post_transaction(&self, req: PostTransactionRequest) -> RpcResult<bool>;

    /// Apply an owner-produced signature line to a posted transaction.
    #[method(name = "signTransaction")]
    async fn sign_transaction(&self, trx_id: String, line: SignatureLine) -> RpcResult<bool>;

    /// Submit an owner-signed balance agreement.
    #[method(name = "balanceAgreement")]
    async fn balance_agreement(&self, ba: BalanceAgreement) -> RpcResult<BalanceAgreementReply>;

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register an externally created identity.
    #[method(name = "registerIdentity")]
    async fn register_identity(&self, identity: Identity) -> RpcResult<bool>;

    /// Create a host-managed identity; returns its id (hex).
    #[method(name = "createIdentity")]
    async fn create_identity(&self, name: String, properties: String) -> RpcResult<String>;

    /// Create the account for (host, owner, note); returns its id (hex).
    #[method(name = "createAccount")]
    async fn create_account(&self, owner_id: String, note_id: String) -> RpcResult<String>;

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Full account state plus derived balances, by account id (hex).
    #[method(name = "getAccount")]
    async fn get_account(&self, account_id: String) -> RpcResult<Option<RpcAccount>>;

    /// Agreed/applied/pending balances by account id (hex).
    #[method(name = "getBalance")]
    async fn get_balance(&self, account_id: String) -> RpcResult<RpcBalance>;

    /// A transaction's wire envelope by id (hex), or null.
    #[method(name = "getTransaction")]
    async fn get_transaction(&self, trx_id: String) -> RpcResult<Option<Transaction>>;

    /// All registered identities.
    #[method(name = "getIdentities")]
    async fn get_identities(&self) -> RpcResult<Vec<RpcIdentity>>;

    /// One identity's full record (including the public key) by id (hex),
    /// or null. Owners use this to verify host signatures locally.
    #[method(name = "getIdentity")]
    async fn get_identity(&self, identity_id: String) -> RpcResult<Option<Identity>>;

    /// All registered asset notes.
    #[method(name = "getAssetNotes")]
    async fn get_asset_notes(&self) -> RpcResult<Vec<RpcAssetNote>>;

    /// Ids (hex) of every account the host administers.
    #[method(name = "getAccounts")]
    async fn get_accounts(&self) -> RpcResult<Vec<String>>;

    // ── Market ───────────────────────────────────────────────────────────────

    /// Build, post and sign an offer for a managed account pair, enter it
    /// into the book, and return any resulting fills.
    #[method(name = "submitOrder")]
    async fn submit_order(&self, req: RpcOrderRequest) -> RpcResult<RpcOrderResult>;
}
