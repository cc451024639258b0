use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use solana_signature::Signature;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use microapi_x402::PaymentError;
use microapi_x402::chain::SolanaRpc;
use microapi_x402::config::Config;
use microapi_x402::flow::PaymentFlowController;
use microapi_x402::lookup::lookup_receipt;
use microapi_x402::poller::ConfirmationPoller;
use microapi_x402::receipts::{FileStore, ReceiptFilter, ReceiptStatus, ReceiptStore, iso_timestamp};
use microapi_x402::reconcile::ReceiptReconciler;
use microapi_x402::transport::{ResourceClient, explorer_url};
use microapi_x402::types::networks::Network;
use microapi_x402::types::proto::v1::PaymentRequirements;
use microapi_x402::util::{SigDown, Telemetry};
use microapi_x402::wallet::{Approver, AutoApprove, KeypairWallet, TerminalApprover, WalletRegistry};

const DEFAULT_CONFIG: &str = "microapi.json";

#[derive(Parser, Debug)]
#[command(name = "microapi-x402")]
#[command(about = "Pay for x402-protected APIs on Solana and keep receipts")]
#[command(version)]
struct CliArgs {
    /// Path to the JSON configuration file [default: microapi.json, if present]
    #[arg(long, short, env = "CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Network to use, overriding the configuration
    #[arg(long, global = true)]
    network: Option<Network>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List wallet adapters and whether they can be used right now
    Wallets,
    /// List the paid resources a provider advertises
    Discover {
        /// Provider base URL
        base_url: Url,
    },
    /// Pay for a resource and print its body
    Pay(PayArgs),
    /// Manage the local receipt history
    #[command(subcommand)]
    Receipts(ReceiptsCommand),
    /// Build a receipt from an on-chain transaction
    Lookup {
        signature: String,
        /// Add the receipt to the local history
        #[arg(long)]
        save: bool,
    },
    /// Resolve every pending receipt against the chain
    Reconcile,
}

#[derive(Args, Debug)]
struct PayArgs {
    url: Url,
    /// Wallet adapter to pay with [default: first available]
    #[arg(long, short)]
    wallet: Option<String>,
    /// Authorize a session key once, then pay without further prompts
    #[arg(long)]
    session: bool,
    /// Approve every signing request without asking
    #[arg(long, short)]
    yes: bool,
    /// Wait for the settlement transaction to confirm
    #[arg(long)]
    wait: bool,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    #[arg(long)]
    status: Option<ReceiptStatus>,
    /// Substring of the network name
    #[arg(long = "on")]
    network: Option<String>,
    /// Case-insensitive search in signature and resource
    #[arg(long)]
    search: Option<String>,
}

impl From<FilterArgs> for ReceiptFilter {
    fn from(args: FilterArgs) -> Self {
        ReceiptFilter {
            status: args.status,
            network: args.network,
            text: args.search,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ReceiptsCommand {
    List(FilterArgs),
    /// Write receipts as CSV
    Export {
        #[command(flatten)]
        filter: FilterArgs,
        /// Output file [default: stdout]
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    Remove {
        signature: String,
    },
    Clear,
}

struct App {
    config: Config,
    network: Network,
    receipts: Arc<ReceiptStore>,
    rpc: Arc<SolanaRpc>,
}

impl App {
    async fn new(args: &CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let config = match &args.config {
            Some(path) => Config::load(path, true)?,
            None => Config::load(Path::new(DEFAULT_CONFIG), false)?,
        };
        let network = args.network.unwrap_or(config.network());
        let store = FileStore::new(config.data_dir());
        let receipts = Arc::new(ReceiptStore::open(Arc::new(store)).await);
        let rpc = Arc::new(SolanaRpc::new(&config.rpc_urls()));
        Ok(Self {
            config,
            network,
            receipts,
            rpc,
        })
    }

    fn wallets(&self, approver: Arc<dyn Approver>) -> Result<WalletRegistry, Box<dyn std::error::Error>> {
        let mut registry = WalletRegistry::new();
        for (name, source) in self.config.wallet_sources()? {
            registry.register(KeypairWallet::new(name, source, Arc::clone(&approver)));
        }
        Ok(registry)
    }

    fn poller(&self) -> Arc<ConfirmationPoller> {
        Arc::new(ConfirmationPoller::new(self.rpc.clone(), self.config.poller()))
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new();
    let args = CliArgs::parse();
    let app = App::new(&args).await?;
    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();

    match args.command {
        Command::Wallets => wallets(&app).await,
        Command::Discover { base_url } => discover(&base_url).await,
        Command::Pay(pay_args) => pay(&app, pay_args, cancellation).await,
        Command::Receipts(command) => receipts(&app, command).await,
        Command::Lookup { signature, save } => lookup(&app, &signature, save).await,
        Command::Reconcile => reconcile(&app, cancellation).await,
    }
}

async fn wallets(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let registry = app.wallets(Arc::new(TerminalApprover))?;
    let available = registry.detect().await;
    for name in registry.registered() {
        let state = if available.contains(name) {
            "available"
        } else {
            "unavailable"
        };
        println!("{name}\t{state}");
    }
    Ok(())
}

async fn discover(base_url: &Url) -> Result<(), Box<dyn std::error::Error>> {
    let document = ResourceClient::default().discover(base_url).await?;
    for resource in &document.accepts {
        let requirements = &resource.requirements;
        let url = resource
            .resource_url(base_url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| resource.route.clone());
        println!(
            "{}\t{}\t{} {}\t{}\t{}",
            resource.method().unwrap_or("GET"),
            url,
            requirements.max_amount_required.as_deref().unwrap_or("?"),
            requirements.asset.as_deref().unwrap_or("?"),
            requirements.network.as_deref().unwrap_or("?"),
            requirements.description.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn select_requirements(
    accepts: &[PaymentRequirements],
    network: Network,
) -> Option<&PaymentRequirements> {
    accepts
        .iter()
        .find(|r| Network::from_str(&r.network).ok() == Some(network))
}

async fn pay(
    app: &App,
    args: PayArgs,
    cancellation: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ResourceClient::default();
    let Some(required) = client.probe_requirements(&args.url).await? else {
        tracing::info!(url = %args.url, "Resource did not ask for payment");
        return Ok(());
    };
    let requirements = select_requirements(&required.accepts, app.network)
        .cloned()
        .ok_or_else(|| format!("Provider accepts no payment on {}", app.network))?;

    let approver: Arc<dyn Approver> = if args.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(TerminalApprover)
    };
    let wallets = Arc::new(app.wallets(approver)?);
    let wallet = match args.wallet {
        Some(name) => name,
        None => wallets
            .detect()
            .await
            .into_iter()
            .next()
            .ok_or("No wallet available: configure one or set MICROAPI_KEYPAIR")?,
    };
    wallets.connect(&wallet).await?;
    if args.session {
        let sessions = wallets.sessions();
        tokio::select! {
            session = sessions.create_session(&wallets, app.config.session_duration()) => { session?; }
            _ = cancellation.cancelled() => return Err("Cancelled".into()),
        }
    }

    let poller = app.poller();
    let reconciler = Arc::new(ReceiptReconciler::new(Arc::clone(&poller), Arc::clone(&app.receipts)));
    let mut controller =
        PaymentFlowController::new(Arc::clone(&wallets), client, Arc::clone(&app.receipts));
    if args.wait {
        controller = controller.with_reconciler(Arc::clone(&reconciler));
    }

    let payment = controller.pay(args.url.clone(), requirements);
    tokio::pin!(payment);
    let result = tokio::select! {
        result = &mut payment => result,
        _ = cancellation.cancelled() => {
            // Once settling, the request is out and its outcome must be recorded.
            if controller.cancel().await || controller.state().is_in_progress() {
                payment.await
            } else {
                Err(PaymentError::Cancelled)
            }
        }
    };
    wallets.disconnect().await;
    let outcome = result?;

    let network = Network::from_str(&outcome.network).unwrap_or(app.network);
    tracing::info!(
        signature = %outcome.signature,
        explorer = %explorer_url(&outcome.signature, network),
        "Paid"
    );
    std::io::stdout().write_all(&outcome.body)?;

    if args.wait {
        tokio::select! {
            _ = reconciler.wait() => {}
            _ = cancellation.cancelled() => poller.shutdown().await,
        }
        if let Some(receipt) = app.receipts.get(&outcome.signature).await {
            tracing::info!(signature = %receipt.signature, status = %receipt.status, "Settlement");
        }
    }
    Ok(())
}

async fn receipts(app: &App, command: ReceiptsCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ReceiptsCommand::List(filter) => {
            for r in app.receipts.list(&filter.into()).await {
                println!(
                    "{}\t{}\t{} {}\t{}\t{}\t{}",
                    iso_timestamp(r.timestamp),
                    r.status,
                    r.amount,
                    r.asset,
                    r.network,
                    r.signature,
                    r.resource
                );
            }
        }
        ReceiptsCommand::Export { filter, output } => {
            let csv = app.receipts.export_csv(&filter.into()).await;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, csv).await?;
                    tracing::info!(path = %path.display(), "Receipts exported");
                }
                None => print!("{csv}"),
            }
        }
        ReceiptsCommand::Remove { signature } => {
            if !app.receipts.remove(&signature).await {
                return Err(format!("No receipt for {signature}").into());
            }
        }
        ReceiptsCommand::Clear => app.receipts.clear().await,
    }
    Ok(())
}

async fn lookup(app: &App, signature: &str, save: bool) -> Result<(), Box<dyn std::error::Error>> {
    let signature = Signature::from_str(signature)?;
    let receipt = lookup_receipt(app.rpc.as_ref(), &signature, app.network).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    if save {
        app.receipts.append(receipt).await;
    }
    Ok(())
}

async fn reconcile(app: &App, cancellation: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let poller = app.poller();
    let reconciler = ReceiptReconciler::new(Arc::clone(&poller), Arc::clone(&app.receipts));
    reconciler.reconcile_pending().await;
    tokio::select! {
        _ = reconciler.wait() => {}
        _ = cancellation.cancelled() => poller.shutdown().await,
    }
    let still_pending = app.receipts.pending().await.len();
    tracing::info!(still_pending, "Reconciliation finished");
    Ok(())
}
