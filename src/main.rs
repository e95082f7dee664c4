use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use userop_cli::bundler::{BundlerClient, HttpTransport};
use userop_cli::config::{load_deployment, Deployment};
use userop_cli::contracts::{EntryPoint, EntryPointApi, Node, Paymaster};
use userop_cli::encoding::{self, pack_user_op, parse_bytes};
use userop_cli::paymaster::PaymasterAuthorizer;
use userop_cli::sender::resolve_and_probe;
use userop_cli::{BuilderConfig, GasMode, OperationBuilder, PlaceholderGas, SimpleUserOperation};

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;
type Builder =
    OperationBuilder<EntryPoint<Client>, Node<Client>, HttpTransport, Paymaster<Client>, LocalWallet>;

// In --json mode stdout carries a single JSON object; everything else goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Sender(SenderArgs),

    /// Build, estimate, sign and send a UserOperation through the bundler.
    Send(SendArgs),

    /// Build with placeholder gas, sign, and execute via EntryPoint.handleOps directly.
    HandleOps(HandleOpsArgs),

    /// Deposit ETH into the EntryPoint on behalf of the paymaster.
    Deposit(DepositArgs),

    /// Mint paymaster gas tokens to an address.
    Mint(MintArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (chainId, rpc, entryPoint, accountFactory, paymaster).
    #[arg(long, default_value = "deployments/sepolia.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Smart account owner private key.
    #[arg(long, env = "USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// CREATE2 salt for the smart account (bytes32 hex or decimal).
    #[arg(long, default_value = "0x01", value_parser = parse_salt_arg)]
    salt: H256,
}

#[derive(Args, Debug)]
struct SenderArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Print a single JSON object to stdout; logs go to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct OpArgs {
    /// Call data executed by the smart account (hex).
    #[arg(long, default_value = "0x")]
    call_data: String,

    /// Paymaster to sponsor gas (defaults to the deployment's paymaster).
    #[arg(long)]
    paymaster: Option<String>,

    /// Pay gas from the account's own deposit.
    #[arg(long, default_value_t = false, conflicts_with = "paymaster")]
    no_paymaster: bool,

    /// Paymaster off-chain signer key.
    #[arg(long, env = "USEROP_PAYMASTER_SIGNER_KEY", hide_env_values = true)]
    paymaster_signer_key: Option<String>,

    /// Seconds the paymaster approval stays valid.
    #[arg(long, default_value_t = 3600)]
    validity_window: u64,

    /// Nonce key passed to EntryPoint.getNonce.
    #[arg(long, default_value_t = 0)]
    nonce_key: u64,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    op: OpArgs,

    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods).
    #[arg(long, env = "USEROP_BUNDLER_URL")]
    bundler: Option<String>,

    /// Safety margin added to bundler gas estimates, in percent.
    #[arg(long, default_value_t = 10)]
    gas_margin_percent: u64,

    /// Fixed paymaster verification gas limit used instead of the bundler's estimate.
    #[arg(long, default_value_t = 1_000_000)]
    paymaster_verification_gas: u64,

    /// Use the bundler's paymaster verification estimate instead of the fixed limit.
    #[arg(long, default_value_t = false)]
    estimate_paymaster_gas: bool,

    /// Build and sign, but do not send.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct HandleOpsArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    op: OpArgs,

    /// Beneficiary of the handleOps refund (defaults to the owner).
    #[arg(long)]
    beneficiary: Option<String>,
}

#[derive(Args, Debug)]
struct DepositArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Account credited in the EntryPoint (defaults to the deployment's paymaster).
    #[arg(long)]
    target: Option<String>,

    /// Amount in ETH (decimal string).
    #[arg(long, default_value = "0.05")]
    amount: String,
}

#[derive(Args, Debug)]
struct MintArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Recipient of the minted gas tokens.
    #[arg(long)]
    target: String,

    /// Amount in whole tokens (18 decimals, decimal string).
    #[arg(long, default_value = "0.01")]
    amount: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Sender(args) => cmd_sender(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::HandleOps(args) => cmd_handle_ops(args).await,
        Command::Deposit(args) => cmd_deposit(args).await,
        Command::Mint(args) => cmd_mint(args).await,
    }
}

/// Loads the deployment, checks the chain id and wires the owner key into a signing client.
async fn connect(
    common: &CommonArgs,
    bundler_override: Option<String>,
) -> Result<(Deployment, Arc<Client>, LocalWallet)> {
    let dep = load_deployment(&common.deployment, common.rpc.clone(), bundler_override)?;

    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.chain_id {
        return Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        ));
    }

    let owner = LocalWallet::from_str(&common.owner_private_key)
        .context("invalid owner private key")?
        .with_chain_id(chain_id);
    let client = Arc::new(SignerMiddleware::new(provider, owner.clone()));
    Ok((dep, client, owner))
}

fn parse_salt_arg(s: &str) -> std::result::Result<H256, String> {
    encoding::parse_salt(s).map_err(|e| e.to_string())
}

fn parse_address(s: &str, what: &str) -> Result<Address> {
    Address::from_str(s).with_context(|| format!("invalid {what} address"))
}

fn simple_op(args: &OpArgs, dep: &Deployment) -> Result<SimpleUserOperation> {
    let call_data = parse_bytes(&args.call_data).context("invalid --call-data hex")?;
    let paymaster = if args.no_paymaster {
        None
    } else if let Some(pm) = args.paymaster.as_deref() {
        Some(parse_address(pm, "--paymaster")?)
    } else {
        dep.paymaster
    };
    Ok(SimpleUserOperation {
        call_data,
        paymaster,
        paymaster_data: Bytes::default(),
    })
}

fn make_builder(
    dep: &Deployment,
    client: Arc<Client>,
    owner: LocalWallet,
    common: &CommonArgs,
    op_args: &OpArgs,
    config: BuilderConfig,
    wants_sponsorship: bool,
) -> Result<Builder> {
    let entry_point = EntryPoint::new(dep.entry_point, client.clone())?;
    let node = Node::new(client.clone());
    let config = BuilderConfig {
        salt: common.salt,
        nonce_key: U256::from(op_args.nonce_key),
        ..config
    };
    let mut builder = OperationBuilder::new(entry_point, node, owner, config);

    if wants_sponsorship {
        let pm_address = dep
            .paymaster
            .ok_or_else(|| anyhow!("sponsorship requested but deployment has no paymaster"))?;
        let key = op_args.paymaster_signer_key.as_deref().ok_or_else(|| {
            anyhow!("sponsorship requires --paymaster-signer-key (or USEROP_PAYMASTER_SIGNER_KEY)")
        })?;
        let signer = LocalWallet::from_str(key).context("invalid paymaster signer key")?;
        let paymaster = Paymaster::new(pm_address, client)?;
        builder = builder.with_paymaster(
            PaymasterAuthorizer::new(paymaster, signer).with_validity_window(op_args.validity_window),
        );
    }

    Ok(builder)
}

async fn cmd_sender(args: SenderArgs) -> Result<()> {
    let (dep, client, owner) = connect(&args.common, None).await?;
    let entry_point = EntryPoint::new(dep.entry_point, client.clone())?;
    let init_code = userop_cli::sender::build_init_code(
        dep.account_factory,
        owner.address(),
        args.common.salt,
        dep.entry_point,
    )?;

    let resolved = resolve_and_probe(init_code, &entry_point, &Node::new(client))
        .await
        .context("failed to resolve sender address")?;

    if args.json {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(owner.address()),
            "smartAccount": encoding::fmt_address(resolved.address),
            "deployed": resolved.deployed,
        });
        println!("{}", out);
    }

    outln!(args.json, "chainId:        {}", dep.chain_id);
    outln!(args.json, "entryPoint:     {}", dep.entry_point);
    outln!(args.json, "factory:        {}", dep.account_factory);
    outln!(args.json, "owner:          {}", owner.address());
    outln!(args.json, "smartAccount:   {}", resolved.address);
    outln!(args.json, "isDeployed:     {}", resolved.deployed);

    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let (dep, client, owner) = connect(&args.common, args.bundler.clone()).await?;
    let bundler_url = dep
        .bundler_url
        .clone()
        .ok_or_else(|| anyhow!("missing --bundler (or USEROP_BUNDLER_URL / bundlerRpc)"))?;

    let simple = simple_op(&args.op, &dep)?;
    let config = BuilderConfig {
        gas_margin_percent: args.gas_margin_percent,
        paymaster_verification_gas_override: (!args.estimate_paymaster_gas)
            .then(|| U256::from(args.paymaster_verification_gas)),
        ..BuilderConfig::new(dep.account_factory)
    };
    let builder = make_builder(
        &dep,
        client,
        owner,
        &args.common,
        &args.op,
        config,
        simple.wants_sponsorship(),
    )?
    .with_bundler(BundlerClient::http(bundler_url));

    let signed = builder
        .build(&simple, GasMode::Estimate)
        .await
        .context("failed to build user operation")?;

    println!(
        "\nUserOperation (final):\n{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&signed.op))?
    );
    println!("userOpHash: {}", encoding::fmt_h256(signed.user_op_hash));

    if args.dry_run {
        println!("\n--dry-run set: not sending user operation.");
        return Ok(());
    }

    let id = builder
        .submit(&signed)
        .await
        .context("bundler send failed")?;
    println!("\neth_sendUserOperation: {}", encoding::fmt_h256(id));
    Ok(())
}

async fn cmd_handle_ops(args: HandleOpsArgs) -> Result<()> {
    let (dep, client, owner) = connect(&args.common, None).await?;
    let beneficiary = match args.beneficiary.as_deref() {
        Some(b) => parse_address(b, "--beneficiary")?,
        None => owner.address(),
    };

    let simple = simple_op(&args.op, &dep)?;
    let config = BuilderConfig {
        placeholder: PlaceholderGas::direct(),
        ..BuilderConfig::new(dep.account_factory)
    };
    let builder = make_builder(
        &dep,
        client,
        owner,
        &args.common,
        &args.op,
        config,
        simple.wants_sponsorship(),
    )?;

    let signed = builder
        .build(&simple, GasMode::Placeholder)
        .await
        .context("failed to build user operation")?;
    let packed = pack_user_op(&signed.op)?;
    tracing::debug!(?packed, "packed user operation");

    let receipt = builder
        .entry_point()
        .handle_ops(&[packed], beneficiary)
        .await
        .context("EntryPoint.handleOps failed")?
        .ok_or_else(|| anyhow!("handleOps tx dropped from mempool"))?;

    println!("userOpHash: {}", encoding::fmt_h256(signed.user_op_hash));
    println!(
        "handleOps receipt:\n{}",
        serde_json::to_string_pretty(&receipt)?
    );
    Ok(())
}

async fn cmd_deposit(args: DepositArgs) -> Result<()> {
    let (dep, client, _owner) = connect(&args.common, None).await?;
    let target = match args.target.as_deref() {
        Some(t) => parse_address(t, "--target")?,
        None => dep
            .paymaster
            .ok_or_else(|| anyhow!("no --target and deployment has no paymaster"))?,
    };
    let value = ethers::utils::parse_ether(&args.amount).context("invalid --amount")?;

    let entry_point = EntryPoint::new(dep.entry_point, client)?;
    entry_point
        .deposit_to(target, value)
        .await
        .context("EntryPoint.depositTo failed")?
        .ok_or_else(|| anyhow!("depositTo tx dropped from mempool"))?;

    tracing::info!(target = ?target, value = %value, "deposit success");
    println!("deposited {} wei for {:?} (EntryPoint {})", value, target, entry_point.address());
    Ok(())
}

async fn cmd_mint(args: MintArgs) -> Result<()> {
    let (dep, client, _owner) = connect(&args.common, None).await?;
    let pm_address = dep
        .paymaster
        .ok_or_else(|| anyhow!("deployment has no paymaster"))?;
    let target = parse_address(&args.target, "--target")?;
    let amount = ethers::utils::parse_ether(&args.amount).context("invalid --amount")?;

    let paymaster = Paymaster::new(pm_address, client)?;
    paymaster
        .mint_tokens(target, amount)
        .await
        .context("Paymaster.mintTokens failed")?
        .ok_or_else(|| anyhow!("mintTokens tx dropped from mempool"))?;

    println!("minted {} gas token units to {:?}", amount, target);
    Ok(())
}
