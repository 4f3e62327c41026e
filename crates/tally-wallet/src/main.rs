//! tally-wallet
//!
//! Owner-side CLI. Manages a Dilithium2 keypair, registers the owner's
//! identity, signs transactions and balance agreements locally, and talks
//! to a running tally-node over JSON-RPC.
//!
//! Usage:
//!   tally-wallet keygen    [--keyfile <path>]
//!   tally-wallet register  --name <name> [--properties <json>]
//!   tally-wallet account   --account <hex>
//!   tally-wallet balance   --account <hex>
//!   tally-wallet transfer  --from <hex> --to <hex> --amount <n>
//!   tally-wallet allocate  --account <hex> --count <n>
//!   tally-wallet sign      --account <hex> --trx <hex> [--reject] [--note <text>]
//!   tally-wallet agree     --account <hex>
//!   tally-wallet confirm   --account <hex>

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use tally_core::{
    AccountConfirmation, Action, AllocateSigNumRequest, BalanceAgreement, PostTransactionRequest,
    SigState, SignatureLine, Transaction, Transfer,
};
use tally_core::account::Account;
use tally_crypto::{Digest, KeyPair};
use tally_rpc::RpcAccount;

mod rpc_client;
use rpc_client::WalletRpcClient;

// ── CLI definition ───────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tally-wallet",
    version,
    about = "Tally wallet — sign transactions and balance agreements"
)]
struct Args {
    /// Path to the keyfile (JSON).
    #[arg(long, global = true, default_value = "~/.tally/wallet.json")]
    keyfile: PathBuf,

    /// Node RPC endpoint.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8545")]
    rpc: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new Dilithium2 keypair and save it to the keyfile.
    Keygen,

    /// Self-sign and register this wallet's identity with the node.
    Register {
        #[arg(long)]
        name: String,
        /// Free-form JSON properties.
        #[arg(long, default_value = "{}")]
        properties: String,
    },

    /// Print the full account state.
    Account {
        #[arg(long)]
        account: String,
    },

    /// Print agreed / applied / pending balances.
    Balance {
        #[arg(long)]
        account: String,
    },

    /// Build and post a transfer transaction.
    Transfer {
        /// Paying account id (hex).
        #[arg(long)]
        from: String,
        /// Receiving account id (hex).
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Request a batch of signature numbers and verify the issuance proof.
    Allocate {
        #[arg(long)]
        account: String,
        #[arg(long, default_value_t = 8)]
        count: u32,
    },

    /// Sign a posted transaction with the next unused reserved number.
    Sign {
        #[arg(long)]
        account: String,
        /// Transaction id (hex).
        #[arg(long)]
        trx: String,
        /// Reject instead of accepting.
        #[arg(long, default_value_t = false)]
        reject: bool,
        #[arg(long)]
        note: Option<String>,
    },

    /// Fold all applied transactions into the agreed balance.
    Agree {
        #[arg(long)]
        account: String,
    },

    /// Counter-sign the current account state.
    Confirm {
        #[arg(long)]
        account: String,
    },
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("warn,tally_wallet=info")
        .init();

    let args = Args::parse();
    let keyfile = expand_tilde(&args.keyfile);
    let client = WalletRpcClient::new(&args.rpc);

    match args.command {
        Command::Keygen => cmd_keygen(&keyfile),

        Command::Register { name, properties } => {
            let keys = load_keypair(&keyfile)?;
            let identity =
                tally_core::Identity::create(&keys, name, properties, now_us(), 0);
            client.register_identity(&identity).await?;
            println!("Registered: {}", identity.id());
            Ok(())
        }

        Command::Account { account } => {
            let acct = fetch_account(&client, &account).await?;
            print_account(&acct);
            Ok(())
        }

        Command::Balance { account } => {
            let bal = client.get_balance(&account).await?;
            println!("Agreed:   {}", bal.balance);
            println!("Applied:  {}", bal.applied_balance);
            println!("Pending:  {}", bal.pending_balance);
            Ok(())
        }

        Command::Transfer {
            from,
            to,
            amount,
            description,
        } => {
            let from_id = parse_digest(&from)?;
            let to_id = parse_digest(&to)?;
            let trx = Transaction::new(
                vec![Action::Transfer(Transfer {
                    from: from_id,
                    to: to_id,
                    amount,
                })],
                description,
                now_ms(),
            )?;
            let trx_id = *trx.id();
            client
                .post_transaction(&PostTransactionRequest {
                    account_id: from_id,
                    transaction: trx,
                })
                .await?;
            println!("Posted: {}", trx_id);
            Ok(())
        }

        Command::Allocate { account, count } => {
            let account_id = parse_digest(&account)?;
            let acct = fetch_account(&client, &account).await?;
            let resp = client
                .allocate_signature_numbers(&AllocateSigNumRequest {
                    account_id,
                    num_new: count,
                })
                .await?;

            // The numbers must be provably host-issued before we treat
            // them as spendable.
            let host = client
                .get_identity(&acct.host)
                .await?
                .context("host identity not registered")?;
            let proof = Account::allocation_digest(&account_id, &resp.new_sig_nums);
            if !host.pub_verify(&proof, &resp.host_signature) {
                bail!("host signature on allocated numbers does not verify");
            }

            println!("Allocated {} numbers:", resp.new_sig_nums.len());
            for n in &resp.new_sig_nums {
                println!("  {n}");
            }
            println!("Run `agree` to fold them into the reserved set.");
            Ok(())
        }

        Command::Sign {
            account,
            trx,
            reject,
            note,
        } => {
            let keys = load_keypair(&keyfile)?;
            let account_id = parse_digest(&account)?;
            let trx_id = parse_digest(&trx)?;
            let acct = fetch_account(&client, &account).await?;

            let state = if reject {
                SigState::Rejected
            } else {
                SigState::Accepted
            };
            let sig_num = if reject {
                0
            } else {
                next_unused_number(&client, &acct, &account_id).await?
            };

            let line = SignatureLine::sign(
                &trx_id,
                account_id,
                now_ms(),
                sig_num,
                state,
                note,
                &keys,
            );
            client.sign_transaction(&trx, &line).await?;
            println!("Signed {} as {}", trx, state);
            Ok(())
        }

        Command::Agree { account } => {
            let keys = load_keypair(&keyfile)?;
            let account_id = parse_digest(&account)?;
            let acct = fetch_account(&client, &account).await?;

            // Accept every allocated number and fold every applied
            // transaction, exactly what the host will recompute.
            let mut delta = 0i64;
            let mut consumed = Vec::new();
            for id in &acct.applied {
                let trx = client
                    .get_transaction(id)
                    .await?
                    .with_context(|| format!("applied transaction {id} not found"))?;
                delta += trx.apply(&account_id);
                if let Some(n) = trx.get_signature_num_for(&account_id) {
                    consumed.push(n);
                }
            }

            let open: BTreeSet<u64> = acct
                .reserved_sig_ids
                .iter()
                .chain(&acct.new_sig_ids)
                .copied()
                .filter(|n| !consumed.contains(n))
                .collect();
            let open: Vec<u64> = open.into_iter().collect();
            let open_new: Vec<u64> = Vec::new();

            let new_balance = acct.balance + delta;
            let new_date = now_ms();
            let digest =
                Account::agreement_digest(&account_id, new_balance, new_date, open.iter());

            let ba = BalanceAgreement {
                account_id,
                owner_signature: keys.sign(&digest),
                new_date,
                new_balance: Some(new_balance),
                new_sig_nums: Some(acct.new_sig_ids.clone()),
                applied_trx_ids: Some(
                    acct.applied
                        .iter()
                        .map(|s| parse_digest(s))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                open_sig_ids: Some(open),
                open_new_sig_ids: Some(open_new),
            };

            let reply = client.balance_agreement(&ba).await?;
            println!("Status: {}", reply.status);
            println!("New balance: {new_balance} at {new_date}");
            Ok(())
        }

        Command::Confirm { account } => {
            let keys = load_keypair(&keyfile)?;
            let account_id = parse_digest(&account)?;
            let acct = fetch_account(&client, &account).await?;

            let digest = Account::agreement_digest(
                &account_id,
                acct.balance,
                acct.balance_date,
                acct.reserved_sig_ids.iter(),
            );
            let ok = client
                .confirm_account(&AccountConfirmation {
                    account_id,
                    owner_sig: keys.sign(&digest),
                })
                .await?;
            println!("Confirmed: {ok}");
            Ok(())
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn cmd_keygen(keyfile: &Path) -> anyhow::Result<()> {
    if keyfile.exists() {
        bail!("keyfile {} already exists", keyfile.display());
    }
    if let Some(parent) = keyfile.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let keys = KeyPair::generate();
    let json = serde_json::to_string(&keys).context("serializing keypair")?;
    std::fs::write(keyfile, json)
        .with_context(|| format!("writing {}", keyfile.display()))?;
    println!("Identity id: {}", keys.id());
    println!("Keyfile:     {}", keyfile.display());
    Ok(())
}

fn load_keypair(keyfile: &Path) -> anyhow::Result<KeyPair> {
    let raw = std::fs::read_to_string(keyfile)
        .with_context(|| format!("reading keyfile {} (run keygen first)", keyfile.display()))?;
    serde_json::from_str(&raw).context("parsing keyfile")
}

fn parse_digest(s: &str) -> anyhow::Result<Digest> {
    Digest::from_hex(s).map_err(|e| anyhow::anyhow!("invalid id {s}: {e}"))
}

async fn fetch_account(client: &WalletRpcClient, account: &str) -> anyhow::Result<RpcAccount> {
    client
        .get_account(account)
        .await?
        .with_context(|| format!("unknown account {account}"))
}

/// Lowest reserved number not consumed by an outbox or applied transaction.
async fn next_unused_number(
    client: &WalletRpcClient,
    acct: &RpcAccount,
    account_id: &Digest,
) -> anyhow::Result<u64> {
    let mut used = Vec::new();
    for id in acct.out_box.iter().chain(&acct.applied) {
        if let Some(trx) = client.get_transaction(id).await? {
            if let Some(n) = trx.get_signature_num_for(account_id) {
                used.push(n);
            }
        }
    }
    acct.reserved_sig_ids
        .iter()
        .copied()
        .find(|n| !used.contains(n))
        .context("no reserved signature numbers available; run allocate + agree")
}

fn print_account(acct: &RpcAccount) {
    println!("Account: {}", acct.account_id);
    println!("Host:    {}", acct.host);
    println!("Owner:   {}", acct.owner);
    println!("Type:    {}", acct.note_type);
    println!(
        "Balance: {} signed on {}  (applied {}, pending {})",
        acct.balance, acct.balance_date, acct.applied_balance, acct.pending_balance
    );
    println!("Reserved Sig #s: {:?}", acct.reserved_sig_ids);
    println!("New Sig #s:      {:?}", acct.new_sig_ids);
    println!("Owner Signed: {}", if acct.owner_signed { "Yes" } else { "No" });
    println!("Host Signed:  {}", if acct.host_signed { "Yes" } else { "No" });
    for (label, list) in [
        ("Applied", &acct.applied),
        ("Pending", &acct.out_box),
        ("Proposed", &acct.in_box),
    ] {
        println!("-- {label} --");
        for id in list {
            println!("  {id}");
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}
