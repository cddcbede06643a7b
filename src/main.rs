use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use hickory_proto::rr::{Name, RecordType};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod backend;
mod cache;
mod config;
mod error;
mod fingerprint;
mod macros;
mod message;
mod query;
mod referral;
mod response;
mod roots;
mod traverser;

use config::{MainStage, ResolveStage, Roots as RootsConfig, TraverseConfig};
use error::TraverseError;
use referral::{OutcomeDist, RefIdx, Referral, ReferralArena};
use traverser::{TraverseResult, Traverser};

/// Explore every referral path a recursive resolver could take to answer a query, from the
/// roots down, and report the probability-weighted distribution of outcomes.
#[derive(Parser, Debug)]
#[command(name = "dnstraverse", version, about)]
struct Cli {
    /// Name to query.
    domain: Name,

    /// Record type to query for.
    #[arg(short = 't', long = "type", default_value = "A")]
    record_type: RecordType,

    /// Use this server IP as the (sole) root instead of discovering one; repeatable.
    #[arg(long = "root-server")]
    root_server: Vec<IpAddr>,

    /// Traverse from every discovered/given root server instead of picking one at random.
    #[arg(long = "all-root-servers")]
    all_root_servers: bool,

    /// EDNS0 UDP payload size advertised in outgoing queries; 512 disables EDNS0.
    #[arg(long = "udp-size", default_value_t = 1232)]
    udp_size: u16,

    /// Allow escalating to TCP when a UDP response is truncated.
    #[arg(long = "allow-tcp", default_value_t = true, action = clap::ArgAction::Set)]
    allow_tcp: bool,

    /// Always query over TCP.
    #[arg(long = "always-tcp")]
    always_tcp: bool,

    /// Maximum referral depth before a branch is failed as depth-exceeded.
    #[arg(long = "max-depth", default_value_t = 20)]
    max_depth: u32,

    /// Retries per query on transport failure.
    #[arg(long = "retries", default_value_t = 2)]
    retries: u32,

    /// Also resolve/query AAAA addresses for referral server names.
    #[arg(long = "follow-aaaa")]
    follow_aaaa: bool,

    /// Resolve root server AAAA addresses too.
    #[arg(long = "root-aaaa")]
    root_aaaa: bool,

    /// Explicitly enable fast-mode dedup (the default).
    #[arg(long = "fast", action = clap::ArgAction::SetTrue)]
    fast_flag: bool,

    /// Disable fast-mode dedup: explore every sub-tree independently, even shared ones.
    #[arg(long = "no-fast", action = clap::ArgAction::SetTrue, conflicts_with = "fast_flag")]
    no_fast_flag: bool,

    /// Print each referral as it is queried, not just in the final tree.
    #[arg(long = "show-progress")]
    show_progress: bool,

    /// Print server-name sub-resolutions as they happen.
    #[arg(long = "show-resolves")]
    show_resolves: bool,

    /// Print the discovered server name/IP inventory.
    #[arg(long = "show-servers")]
    show_servers: bool,

    /// Print the outcome distribution for every referral, not just the top level.
    #[arg(long = "show-all-stats")]
    show_all_stats: bool,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Debug logging (takes priority over --verbose).
    #[arg(long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli) {
        eprintln!("error: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let traverser = Traverser::new(config);
    match traverser.run_query().await {
        Ok(result) => {
            render_report(&cli, &traverser, &result).await;
            ExitCode::SUCCESS
        }
        Err(TraverseError::NoUsableRoots(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn setup_tracing(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<TraverseConfig, TraverseError> {
    let mut config = TraverseConfig::new(cli.domain.clone());
    config.qtype = cli.record_type;
    config.roots = if cli.root_server.is_empty() {
        RootsConfig::Discover
    } else {
        RootsConfig::Explicit(cli.root_server.clone())
    };
    config.all_roots = cli.all_root_servers;
    config.follow_aaaa = cli.follow_aaaa;
    config.root_aaaa = cli.root_aaaa;
    config.always_tcp = cli.always_tcp;
    config.allow_tcp = cli.allow_tcp;
    config.udp_size = cli.udp_size;
    config.max_depth = cli.max_depth;
    config.retries = cli.retries;
    config.timeout = Duration::from_secs(2);
    config.fast = !cli.no_fast_flag;

    if cli.show_progress {
        config.on_main = Some(Box::new(print_main_progress));
    }
    if cli.show_resolves {
        config.on_resolve = Some(Box::new(print_resolve_progress));
    }

    // Checked last so every network-affecting flag above is in place before we decide
    // whether the combination they describe is even sane.
    config.validate()?;
    Ok(config)
}

fn print_main_progress(stage: MainStage, referral: &Referral) {
    match stage {
        MainStage::Start => println!(
            "[progress] {} querying {} {} under {}",
            referral.refid, referral.server_name, referral.query, referral.bailiwick
        ),
        MainStage::NewReferralSet => println!(
            "[progress] {} referral set: {} child referral(s)",
            referral.refid,
            referral.children.len()
        ),
        MainStage::Answer => {
            println!("[progress] {} -> {:?}", referral.refid, referral.state)
        }
        MainStage::AnswerFast => {
            println!("[progress] {} fast-skipped (dedup hit)", referral.refid)
        }
    }
}

fn print_resolve_progress(stage: ResolveStage, name: &Name) {
    match stage {
        ResolveStage::Start => println!("[resolve] resolving server {name}"),
        ResolveStage::AnswerFast => println!("[resolve] resolved server {name}"),
    }
}

async fn render_report(cli: &Cli, traverser: &Traverser, result: &TraverseResult) {
    println!();
    println!("Referral tree for {} {} {}", cli.domain, "IN", cli.record_type);
    for &root in &result.roots {
        print_referral_subtree(&result.arena, root);
    }

    println!();
    println!("Outcome distribution:");
    print_distribution(&result.overall);

    if cli.show_all_stats {
        println!();
        println!("Per-referral outcome distributions:");
        let mut idxs: Vec<RefIdx> = result.distributions.keys().copied().collect();
        idxs.sort_by_key(|i| i.0);
        for idx in idxs {
            let referral = result.arena.get(idx);
            println!("  {} ({} {}):", referral.refid, referral.server_name, referral.bailiwick);
            print_distribution(&result.distributions[&idx]);
        }
    }

    if cli.show_servers {
        println!();
        println!("Servers encountered:");
        print_server_inventory(traverser, result).await;
    }
}

fn print_referral_subtree(arena: &ReferralArena, idx: RefIdx) {
    let referral = arena.get(idx);
    let ips: Vec<String> = referral.server_ips.iter().map(IpAddr::to_string).collect();
    println!(
        "{:<10} {:<30} [{}] bailiwick={} state={:?}",
        referral.refid.to_string(),
        referral.server_name,
        ips.join(","),
        referral.bailiwick,
        referral.state,
    );
    for &child in &referral.children {
        print_referral_subtree(arena, child);
    }
}

fn print_distribution(dist: &OutcomeDist) {
    let mut entries: Vec<_> = dist.iter().collect();
    entries.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (outcome, p) in entries {
        println!("  {:<14} {:>6.2}%", outcome.to_string(), p * 100.0);
    }
}

async fn print_server_inventory(traverser: &Traverser, result: &TraverseResult) {
    let all_ips: Vec<IpAddr> =
        result.servers_encountered.values().flat_map(|ips| ips.iter().copied()).collect();
    let identities = traverser.identify_servers(&all_ips).await;

    let mut names: Vec<_> = result.servers_encountered.keys().collect();
    names.sort_by_key(|n| n.to_string());
    for name in names {
        let mut ips: Vec<IpAddr> = result.servers_encountered[name].iter().copied().collect();
        ips.sort();
        for ip in ips {
            let identity =
                identities.get(&ip).and_then(|o| o.clone()).unwrap_or_else(|| "unknown".to_string());
            println!("  {name}\t{ip}\t{identity}");
        }
    }
}
