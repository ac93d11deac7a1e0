use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nir_exchange::{
    chain::{Call, Chain, Receipt},
    config::Config,
    exchange::{OrderId, ETHER},
    store,
    units::{format_units, parse_units, DEFAULT_DECIMALS},
    Address, Amount,
};
use rand::rngs::OsRng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nirx")]
#[command(about = "NIR token ledger and token/ether exchange", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State file, overrides `state_path` from the config
    #[arg(short, long, global = true)]
    state: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the token and the exchange into a fresh state file
    Init {
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },

    /// Print the address derived from a label
    Address { label: String },

    /// Print a random account address
    Keygen,

    /// Show height, deployed contracts and state root
    Status,

    /// Print every receipt recorded so far
    Log,

    /// Replay the reference scenarios on an in-memory chain
    Demo,

    #[command(subcommand)]
    Token(TokenCommand),

    #[command(subcommand)]
    Exchange(ExchangeCommand),
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Name, symbol, decimals and total supply
    Info(TokenTarget),
    /// Wallet balance of an account
    Balance {
        account: String,
        #[command(flatten)]
        target: TokenTarget,
    },
    /// Remaining amount `spender` may move out of `owner`
    Allowance {
        owner: String,
        spender: String,
        #[command(flatten)]
        target: TokenTarget,
    },
    Transfer {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Whole tokens, fractions allowed
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: TokenTarget,
    },
    Approve {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        spender: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: TokenTarget,
    },
    TransferFrom {
        #[arg(long)]
        spender: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: TokenTarget,
    },
}

#[derive(Args)]
struct TokenTarget {
    /// Token contract; defaults to the first deployed token
    #[arg(long)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum ExchangeCommand {
    /// Fee account, fee percent and order count
    Info(ExchangeTarget),
    /// Custodial balance; `asset` is `ether`, `token` or an address
    Balance {
        asset: String,
        user: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    DepositEther {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    DepositToken {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    WithdrawEther {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    WithdrawToken {
        #[arg(long)]
        user: String,
        #[arg(long)]
        amount: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    /// Send ether straight to the exchange (always rejected)
    SendEther {
        #[arg(long)]
        from: String,
        #[arg(long)]
        value: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    MakeOrder {
        #[arg(long)]
        user: String,
        /// Asset wanted: `ether`, `token` or an address
        #[arg(long)]
        get: String,
        #[arg(long)]
        amount_get: String,
        /// Asset offered: `ether`, `token` or an address
        #[arg(long)]
        give: String,
        #[arg(long)]
        amount_give: String,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    CancelOrder {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: OrderId,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    FillOrder {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: OrderId,
        #[command(flatten)]
        target: ExchangeTarget,
    },
    /// List open orders
    Orders(ExchangeTarget),
}

#[derive(Args)]
struct ExchangeTarget {
    /// Exchange contract; defaults to the first deployed exchange
    #[arg(long)]
    exchange: Option<String>,
    /// Token traded on the exchange; defaults to the first deployed token
    #[arg(long)]
    token: Option<String>,
}

fn account(text: &str) -> Result<Address> {
    Address::resolve(text).with_context(|| format!("invalid account {text:?}"))
}

fn amount(text: &str, decimals: u8) -> Result<Amount> {
    parse_units(text, decimals)
        .ok_or_else(|| anyhow!("invalid amount {text:?} for {decimals} decimals"))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A chain loaded from the state file, saved back after each call.
struct Session {
    state_path: PathBuf,
    chain: Chain,
}

impl Session {
    fn open(state_path: PathBuf) -> Result<Self> {
        let state = store::load(&state_path)?.ok_or_else(|| {
            anyhow!(
                "no state at {}; run `nirx init` first",
                state_path.display()
            )
        })?;
        Ok(Self {
            state_path,
            chain: Chain::from_state(state),
        })
    }

    fn token(&self, explicit: Option<&str>) -> Result<Address> {
        match explicit {
            Some(text) => account(text),
            None => self
                .chain
                .summary()
                .tokens
                .first()
                .copied()
                .ok_or_else(|| anyhow!("no token deployed")),
        }
    }

    fn exchange(&self, explicit: Option<&str>) -> Result<Address> {
        match explicit {
            Some(text) => account(text),
            None => self
                .chain
                .summary()
                .exchanges
                .first()
                .copied()
                .ok_or_else(|| anyhow!("no exchange deployed")),
        }
    }

    fn decimals(&self, token: &Address) -> Result<u8> {
        Ok(self.chain.token(token, |t| t.decimals())?)
    }

    /// `ether`/`eth` → the ether sentinel, `token` → the default token.
    fn asset(&self, text: &str, default_token: Address) -> Result<Address> {
        match text {
            "ether" | "eth" => Ok(ETHER),
            "token" => Ok(default_token),
            other => account(other),
        }
    }

    fn asset_decimals(&self, asset: &Address) -> Result<u8> {
        if *asset == ETHER {
            Ok(DEFAULT_DECIMALS)
        } else {
            self.decimals(asset)
        }
    }

    fn submit(&self, call: Call) -> Result<()> {
        let receipt = self.chain.submit(call, now())?;
        store::save(&self.state_path, &self.chain.state())?;
        print_json(&receipt)
    }
}

fn init(config: &Config, state_path: PathBuf, force: bool) -> Result<()> {
    if !force && store::load(&state_path)?.is_some() {
        bail!(
            "state {} already exists; pass --force to replace it",
            state_path.display()
        );
    }
    let deployer = config.deployer()?;
    let chain = Chain::new();
    chain.deploy_token(
        deployer,
        &config.token.name,
        &config.token.symbol,
        config.token.decimals,
        config.total_supply()?,
    );
    chain.deploy_exchange(deployer, config.fee_account()?, config.exchange.fee_percent);
    store::save(&state_path, &chain.state())?;
    print_json(&chain.summary())
}

#[derive(Serialize)]
struct TokenInfo<'a> {
    address: Address,
    name: &'a str,
    symbol: &'a str,
    decimals: u8,
    total_supply: String,
}

fn token_cmd(session: &Session, cmd: TokenCommand) -> Result<()> {
    match cmd {
        TokenCommand::Info(target) => {
            let token = session.token(target.token.as_deref())?;
            session.chain.token(&token, |t| {
                print_json(&TokenInfo {
                    address: t.address(),
                    name: t.name(),
                    symbol: t.symbol(),
                    decimals: t.decimals(),
                    total_supply: format_units(t.total_supply(), t.decimals()),
                })
            })?
        }
        TokenCommand::Balance { account: who, target } => {
            let token = session.token(target.token.as_deref())?;
            let who = account(&who)?;
            let (balance, decimals) = session
                .chain
                .token(&token, |t| (t.balance_of(&who), t.decimals()))?;
            println!("{}", format_units(balance, decimals));
            Ok(())
        }
        TokenCommand::Allowance {
            owner,
            spender,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let (owner, spender) = (account(&owner)?, account(&spender)?);
            let (allowed, decimals) = session
                .chain
                .token(&token, |t| (t.allowance(&owner, &spender), t.decimals()))?;
            println!("{}", format_units(allowed, decimals));
            Ok(())
        }
        TokenCommand::Transfer {
            from,
            to,
            amount: value,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let decimals = session.decimals(&token)?;
            session.submit(Call::Transfer {
                token,
                from: account(&from)?,
                to: account(&to)?,
                amount: amount(&value, decimals)?,
            })
        }
        TokenCommand::Approve {
            owner,
            spender,
            amount: value,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let decimals = session.decimals(&token)?;
            session.submit(Call::Approve {
                token,
                owner: account(&owner)?,
                spender: account(&spender)?,
                amount: amount(&value, decimals)?,
            })
        }
        TokenCommand::TransferFrom {
            spender,
            owner,
            to,
            amount: value,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let decimals = session.decimals(&token)?;
            session.submit(Call::TransferFrom {
                token,
                spender: account(&spender)?,
                owner: account(&owner)?,
                to: account(&to)?,
                amount: amount(&value, decimals)?,
            })
        }
    }
}

#[derive(Serialize)]
struct ExchangeInfo {
    address: Address,
    fee_account: Address,
    fee_percent: u32,
    order_count: OrderId,
    ether_custody: String,
}

fn exchange_cmd(session: &Session, cmd: ExchangeCommand) -> Result<()> {
    match cmd {
        ExchangeCommand::Info(target) => {
            let exchange = session.exchange(target.exchange.as_deref())?;
            session.chain.exchange(&exchange, |x| {
                print_json(&ExchangeInfo {
                    address: x.address(),
                    fee_account: x.fee_account(),
                    fee_percent: x.fee_percent(),
                    order_count: x.order_count(),
                    ether_custody: format_units(x.ether_custody(), DEFAULT_DECIMALS),
                })
            })?
        }
        ExchangeCommand::Balance {
            asset,
            user,
            target,
        } => {
            let exchange = session.exchange(target.exchange.as_deref())?;
            let asset = session.asset(&asset, session.token(target.token.as_deref())?)?;
            let decimals = session.asset_decimals(&asset)?;
            let user = account(&user)?;
            let balance = session.chain.exchange(&exchange, |x| x.balance_of(&asset, &user))?;
            println!("{}", format_units(balance, decimals));
            Ok(())
        }
        ExchangeCommand::DepositEther {
            user,
            amount: value,
            target,
        } => session.submit(Call::DepositEther {
            exchange: session.exchange(target.exchange.as_deref())?,
            user: account(&user)?,
            amount: amount(&value, DEFAULT_DECIMALS)?,
        }),
        ExchangeCommand::DepositToken {
            user,
            amount: value,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let decimals = session.asset_decimals(&token)?;
            session.submit(Call::DepositToken {
                exchange: session.exchange(target.exchange.as_deref())?,
                token,
                user: account(&user)?,
                amount: amount(&value, decimals)?,
            })
        }
        ExchangeCommand::WithdrawEther {
            user,
            amount: value,
            target,
        } => session.submit(Call::WithdrawEther {
            exchange: session.exchange(target.exchange.as_deref())?,
            user: account(&user)?,
            amount: amount(&value, DEFAULT_DECIMALS)?,
        }),
        ExchangeCommand::WithdrawToken {
            user,
            amount: value,
            target,
        } => {
            let token = session.token(target.token.as_deref())?;
            let decimals = session.asset_decimals(&token)?;
            session.submit(Call::WithdrawToken {
                exchange: session.exchange(target.exchange.as_deref())?,
                token,
                user: account(&user)?,
                amount: amount(&value, decimals)?,
            })
        }
        ExchangeCommand::SendEther { from, value, target } => session.submit(Call::SendEther {
            to: session.exchange(target.exchange.as_deref())?,
            from: account(&from)?,
            value: amount(&value, DEFAULT_DECIMALS)?,
        }),
        ExchangeCommand::MakeOrder {
            user,
            get,
            amount_get,
            give,
            amount_give,
            target,
        } => {
            let default_token = session.token(target.token.as_deref())?;
            let token_get = session.asset(&get, default_token)?;
            let token_give = session.asset(&give, default_token)?;
            session.submit(Call::MakeOrder {
                exchange: session.exchange(target.exchange.as_deref())?,
                user: account(&user)?,
                token_get,
                amount_get: amount(&amount_get, session.asset_decimals(&token_get)?)?,
                token_give,
                amount_give: amount(&amount_give, session.asset_decimals(&token_give)?)?,
            })
        }
        ExchangeCommand::CancelOrder { user, id, target } => session.submit(Call::CancelOrder {
            exchange: session.exchange(target.exchange.as_deref())?,
            user: account(&user)?,
            id,
        }),
        ExchangeCommand::FillOrder { user, id, target } => session.submit(Call::FillOrder {
            exchange: session.exchange(target.exchange.as_deref())?,
            user: account(&user)?,
            id,
        }),
        ExchangeCommand::Orders(target) => {
            let exchange = session.exchange(target.exchange.as_deref())?;
            let open = session
                .chain
                .exchange(&exchange, |x| x.open_orders().cloned().collect::<Vec<_>>())?;
            print_json(&open)
        }
    }
}

/// Replays the reference scenarios and prints one JSON line per outcome.
fn demo(config: &Config) -> Result<()> {
    let chain = Chain::new();
    let deployer = config.deployer()?;
    let fee_account = config.fee_account()?;
    let user1 = Address::derive("user1");
    let user2 = Address::derive("user2");
    let decimals = config.token.decimals;
    let units = |text: &str| amount(text, decimals);

    let token = chain.deploy_token(
        deployer,
        &config.token.name,
        &config.token.symbol,
        decimals,
        config.total_supply()?,
    );
    let exchange = chain.deploy_exchange(deployer, fee_account, config.exchange.fee_percent);

    let steps = vec![
        Call::Transfer {
            token,
            from: deployer,
            to: user1,
            amount: units("100")?,
        },
        Call::Transfer {
            token,
            from: deployer,
            to: Address::ZERO,
            amount: units("100")?,
        },
        Call::DepositEther {
            exchange,
            user: user1,
            amount: amount("1", DEFAULT_DECIMALS)?,
        },
        Call::SendEther {
            to: exchange,
            from: user1,
            value: 1,
        },
        Call::DepositToken {
            exchange,
            token,
            user: user1,
            amount: units("10")?,
        },
        Call::Approve {
            token,
            owner: user1,
            spender: exchange,
            amount: units("10")?,
        },
        Call::DepositToken {
            exchange,
            token,
            user: user1,
            amount: units("10")?,
        },
        Call::DepositToken {
            exchange,
            token: ETHER,
            user: user1,
            amount: units("10")?,
        },
        Call::Transfer {
            token,
            from: deployer,
            to: user2,
            amount: units("100")?,
        },
        Call::Approve {
            token,
            owner: user2,
            spender: exchange,
            amount: units("100")?,
        },
        Call::DepositToken {
            exchange,
            token,
            user: user2,
            amount: units("100")?,
        },
        Call::MakeOrder {
            exchange,
            user: user1,
            token_get: token,
            amount_get: units("50")?,
            token_give: ETHER,
            amount_give: amount("1", DEFAULT_DECIMALS)?,
        },
        Call::FillOrder {
            exchange,
            user: user2,
            id: 1,
        },
    ];

    for (step, call) in steps.into_iter().enumerate() {
        let line = match chain.submit(call.clone(), step as u64) {
            Ok(Receipt { height, record, .. }) => serde_json::json!({
                "op": call.name(),
                "height": height,
                "record": record,
            }),
            Err(err) => serde_json::json!({
                "op": call.name(),
                "rejected": err.to_string(),
            }),
        };
        println!("{line}");
    }
    print_json(&chain.summary())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(cli.config.as_deref())?;
    let state_path = cli.state.clone().unwrap_or_else(|| config.state_path.clone());

    match cli.command {
        Commands::Init { force } => init(&config, state_path, force),
        Commands::Address { label } => {
            println!("{}", Address::derive(&label));
            Ok(())
        }
        Commands::Keygen => {
            println!("{}", Address::random(&mut OsRng));
            Ok(())
        }
        Commands::Demo => demo(&config),
        Commands::Status => print_json(&Session::open(state_path)?.chain.summary()),
        Commands::Log => {
            let session = Session::open(state_path)?;
            for receipt in session.chain.receipts() {
                println!("{}", serde_json::to_string(&receipt)?);
            }
            Ok(())
        }
        Commands::Token(cmd) => token_cmd(&Session::open(state_path)?, cmd),
        Commands::Exchange(cmd) => exchange_cmd(&Session::open(state_path)?, cmd),
    }
}
