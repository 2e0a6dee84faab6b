use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;
use tributary_client::in_memory::{InMemoryLinkFactory, StaticPartitionSource};
use tributary_client::{
    ClientError, ErrorContext, EventContext, EventData, EventHandler, EventProcessor,
    LoadBalancingStrategy, PassSummary, ProcessorOptions,
};
use tributary_core::{Clock, ManualClock, MemoryOwnershipStore, OwnershipStore};

const EVENT_HUB: &str = "simulation";
const CONSUMER_GROUP: &str = "$Default";

#[derive(Debug, Parser)]
#[command(after_help = EXAMPLES_TEXT)]
pub struct Simulate {
    #[arg(long, short = 'p', default_value_t = 8, help = "Number of partitions of the event hub")]
    pub partitions: usize,

    #[arg(long, short = 'i', default_value_t = 3, help = "Number of processor instances")]
    pub instances: usize,

    #[arg(long, short = 'n', default_value_t = 10, help = "Number of load balancing passes to run")]
    pub passes: usize,

    #[arg(long, value_enum, help = "Load balancing strategy. Default: balanced")]
    pub strategy: Option<StrategyArg>,

    #[arg(long, help = "Seconds after which a record that was not renewed is claimable")]
    pub inactivity_secs: Option<u64>,

    #[arg(
        long,
        help = "Stop an instance abruptly (no relinquish) before the given pass. Format: INSTANCE@PASS"
    )]
    pub crash: Vec<InstanceAtPass>,

    #[arg(long, help = "Start an instance only from the given pass. Format: INSTANCE@PASS")]
    pub join: Vec<InstanceAtPass>,

    #[arg(long, help = "Path to a JSON file with the processor options")]
    pub options: Option<PathBuf>,

    #[arg(long, help = "Print one JSON report per pass instead of a table")]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum StrategyArg {
    Balanced,
    Greedy,
}

impl From<StrategyArg> for LoadBalancingStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::Balanced => LoadBalancingStrategy::Balanced,
            StrategyArg::Greedy => LoadBalancingStrategy::Greedy,
        }
    }
}

/// An instance index and a pass number, written `INSTANCE@PASS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceAtPass {
    pub instance: usize,
    pub pass: usize,
}

impl FromStr for InstanceAtPass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (instance, pass) = s
            .split_once('@')
            .ok_or_else(|| format!("expected INSTANCE@PASS, got '{s}'"))?;
        let instance = instance
            .trim()
            .parse()
            .map_err(|_| format!("invalid instance index '{instance}'"))?;
        let pass = pass
            .trim()
            .parse()
            .map_err(|_| format!("invalid pass number '{pass}'"))?;
        if pass == 0 {
            return Err("passes are numbered from 1".to_string());
        }
        Ok(InstanceAtPass { instance, pass })
    }
}

const EXAMPLES_TEXT: &str = r#"
EXAMPLES:
    # Three instances sharing eight partitions
    tributary-cli simulate --partitions 8 --instances 3 --passes 6

    # A fourth instance joins late and steals its share
    tributary-cli simulate -p 8 -i 4 -n 12 --join 3@5

    # Instance 1 crashes before pass 4; its partitions are reclaimed once expired
    tributary-cli simulate -p 6 -i 3 -n 14 --crash 1@4 --inactivity-secs 30

    # Greedy strategy, options from a file, JSON output
    tributary-cli simulate -p 16 -i 4 --strategy greedy --options ./processor.json --json
"#;

/// Ownership as seen by the store after one pass of every live instance.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass: usize,
    pub elapsed_secs: u64,
    /// Active owner -> owned partitions.
    pub owners: BTreeMap<String, Vec<String>>,
    pub unowned: Vec<String>,
    pub crashed: Vec<String>,
    /// Every partition owned, only by live instances, each holding floor(P/K) or ceil(P/K).
    pub balanced: bool,
    pub instances: BTreeMap<String, PassSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Waiting,
    Live,
    Crashed,
}

struct Instance {
    name: String,
    processor: EventProcessor,
    join_at: usize,
    crash_at: Option<usize>,
}

impl Instance {
    fn state(&self, pass: usize) -> InstanceState {
        match self.crash_at {
            Some(crash_at) if pass >= crash_at => InstanceState::Crashed,
            _ if pass < self.join_at => InstanceState::Waiting,
            _ => InstanceState::Live,
        }
    }
}

// simulated instances never see events, they only balance
struct IdleHandler;

#[async_trait]
impl EventHandler for IdleHandler {
    async fn process_event(&self, _context: EventContext, _event: EventData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_error(&self, context: ErrorContext, error: ClientError) {
        info!(partition_id = %context.partition.partition_id, error = %error, "pump reported an error");
    }
}

pub async fn handle_simulate(simulate: Simulate) -> Result<()> {
    let reports = run_simulation(&simulate).await?;

    for report in &reports {
        if simulate.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            print_report(report);
        }
    }

    if !simulate.json {
        match reports.iter().find(|r| r.balanced) {
            Some(first) => println!("Balanced since pass {} and stable: {}", first.pass, is_stable(&reports)),
            None => println!("Not balanced after {} passes", reports.len()),
        }
    }
    Ok(())
}

fn load_options(simulate: &Simulate) -> Result<ProcessorOptions> {
    let mut options = match &simulate.options {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read options file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse options file: {}", path.display()))?
        }
        None => ProcessorOptions::default(),
    };

    if let Some(strategy) = simulate.strategy {
        options.strategy = strategy.into();
    }
    if let Some(secs) = simulate.inactivity_secs {
        options.partition_ownership_expiration_ms = secs.saturating_mul(1000);
    }
    options.validate()?;
    Ok(options)
}

/// Runs the whole simulation and returns one report per pass.
pub async fn run_simulation(simulate: &Simulate) -> Result<Vec<PassReport>> {
    if simulate.instances == 0 {
        bail!("at least one instance is required");
    }
    for event in simulate.crash.iter().chain(simulate.join.iter()) {
        if event.instance >= simulate.instances {
            bail!(
                "instance {} does not exist, valid indexes are 0..{}",
                event.instance,
                simulate.instances
            );
        }
    }

    let options = load_options(simulate)?;
    let interval = options.load_balancing_interval();
    let expiration = options.partition_ownership_expiration();

    let clock = ManualClock::new(SystemTime::now());
    let store: Arc<dyn OwnershipStore> =
        Arc::new(MemoryOwnershipStore::with_clock(Arc::new(clock.clone())));
    let source = Arc::new(StaticPartitionSource::with_count(simulate.partitions));
    let links = Arc::new(InMemoryLinkFactory::new(EVENT_HUB));
    let handler = Arc::new(IdleHandler);

    let mut instances = Vec::with_capacity(simulate.instances);
    for index in 0..simulate.instances {
        let name = format!("instance-{index}");
        let crash_at = simulate
            .crash
            .iter()
            .filter(|c| c.instance == index)
            .map(|c| c.pass)
            .min();
        let join_at = simulate
            .join
            .iter()
            .filter(|j| j.instance == index)
            .map(|j| j.pass)
            .max()
            .unwrap_or(1);

        let mut instance_options = options.clone();
        if crash_at.is_some() {
            instance_options.relinquish_on_stop = false;
        }
        let processor = EventProcessor::builder()
            .with_event_hub(EVENT_HUB)
            .with_consumer_group(CONSUMER_GROUP)
            .with_owner_id(name.clone())
            .with_ownership_store(Arc::clone(&store))
            .with_partition_source(source.clone())
            .with_link_factory(links.clone())
            .with_event_handler(handler.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_options(instance_options)
            .build()?;
        instances.push(Instance {
            name,
            processor,
            join_at,
            crash_at,
        });
    }

    info!(
        partitions = simulate.partitions,
        instances = simulate.instances,
        passes = simulate.passes,
        strategy = ?options.strategy,
        "starting load balancing simulation"
    );

    let mut reports = Vec::with_capacity(simulate.passes);
    for pass in 1..=simulate.passes {
        let mut summaries = BTreeMap::new();
        let mut crashed = Vec::new();

        for instance in &instances {
            match instance.state(pass) {
                InstanceState::Waiting => {}
                InstanceState::Crashed => {
                    if instance.crash_at == Some(pass) {
                        info!(owner_id = %instance.name, pass, "instance crashed");
                        instance.processor.stop().await;
                    }
                    crashed.push(instance.name.clone());
                }
                InstanceState::Live => {
                    let summary = instance.processor.run_once().await;
                    summaries.insert(instance.name.clone(), summary);
                }
            }
        }

        let now = clock.now();
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unowned = Vec::new();
        let records = store.list_ownership(EVENT_HUB, CONSUMER_GROUP).await?;
        for partition_id in (0..simulate.partitions).map(|p| p.to_string()) {
            let owner = records
                .iter()
                .find(|r| r.partition_id == partition_id)
                .filter(|r| r.is_active(now, expiration))
                .and_then(|r| r.owner());
            match owner {
                Some(owner) => owners.entry(owner.to_string()).or_default().push(partition_id),
                None => unowned.push(partition_id),
            }
        }

        let live: Vec<&str> = summaries.keys().map(String::as_str).collect();
        let balanced = is_balanced(simulate.partitions, &live, &owners, &unowned);
        reports.push(PassReport {
            pass,
            elapsed_secs: interval.as_secs() * (pass as u64 - 1),
            owners,
            unowned,
            crashed,
            balanced,
            instances: summaries,
        });

        clock.advance(interval);
    }

    for instance in &instances {
        instance.processor.stop().await;
    }
    Ok(reports)
}

fn is_balanced(
    partitions: usize,
    live: &[&str],
    owners: &BTreeMap<String, Vec<String>>,
    unowned: &[String],
) -> bool {
    if !unowned.is_empty() || live.is_empty() {
        return partitions == 0;
    }
    if owners.keys().any(|owner| !live.contains(&owner.as_str())) {
        return false;
    }
    let min = partitions / live.len();
    let max = min + usize::from(partitions % live.len() != 0);
    live.iter().all(|instance| {
        let held = owners.get(*instance).map_or(0, Vec::len);
        (min..=max).contains(&held)
    })
}

// no ownership change since the first balanced pass
fn is_stable(reports: &[PassReport]) -> bool {
    let balanced: Vec<&PassReport> = reports.iter().skip_while(|r| !r.balanced).collect();
    balanced.windows(2).all(|w| w[0].owners == w[1].owners)
}

fn print_report(report: &PassReport) {
    let owners: Vec<String> = report
        .owners
        .iter()
        .map(|(owner, partitions)| format!("{owner}=[{}]", partitions.join(",")))
        .collect();
    println!(
        "pass {:>3} (t={:>4}s): {} unowned=[{}]{}{}",
        report.pass,
        report.elapsed_secs,
        owners.join(" "),
        report.unowned.join(","),
        if report.crashed.is_empty() {
            String::new()
        } else {
            format!(" crashed=[{}]", report.crashed.join(","))
        },
        if report.balanced { " balanced" } else { "" },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulate(partitions: usize, instances: usize, passes: usize) -> Simulate {
        Simulate {
            partitions,
            instances,
            passes,
            strategy: None,
            inactivity_secs: None,
            crash: Vec::new(),
            join: Vec::new(),
            options: None,
            json: true,
        }
    }

    #[test]
    fn test_parse_instance_at_pass() {
        assert_eq!(
            "2@7".parse::<InstanceAtPass>(),
            Ok(InstanceAtPass { instance: 2, pass: 7 })
        );
        assert!("2".parse::<InstanceAtPass>().is_err());
        assert!("a@1".parse::<InstanceAtPass>().is_err());
        assert!("1@0".parse::<InstanceAtPass>().is_err());
    }

    #[test]
    fn test_is_balanced() {
        let owners: BTreeMap<String, Vec<String>> = [
            ("a".to_string(), vec!["0".to_string(), "1".to_string()]),
            ("b".to_string(), vec!["2".to_string()]),
        ]
        .into();
        assert!(is_balanced(3, &["a", "b"], &owners, &[]));
        assert!(!is_balanced(3, &["a", "b", "c"], &owners, &[]));
        assert!(!is_balanced(4, &["a", "b"], &owners, &["3".to_string()]));
        // a crashed owner still holding partitions
        assert!(!is_balanced(3, &["a"], &owners, &[]));
    }

    #[tokio::test]
    async fn test_simulation_converges() {
        let reports = run_simulation(&simulate(6, 3, 6)).await.unwrap();
        let last = reports.last().unwrap();
        assert!(last.balanced);
        assert_eq!(last.owners.values().map(Vec::len).sum::<usize>(), 6);
        assert!(is_stable(&reports));
    }

    #[tokio::test]
    async fn test_crashed_instance_is_replaced() {
        let mut args = simulate(4, 2, 12);
        args.crash.push(InstanceAtPass { instance: 1, pass: 4 });
        args.inactivity_secs = Some(30);

        let reports = run_simulation(&args).await.unwrap();
        let last = reports.last().unwrap();
        assert_eq!(last.crashed, vec!["instance-1"]);
        assert_eq!(last.owners.len(), 1);
        assert_eq!(last.owners["instance-0"].len(), 4);
        assert!(last.balanced);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_rejected() {
        let mut args = simulate(4, 2, 3);
        args.join.push(InstanceAtPass { instance: 5, pass: 2 });
        assert!(run_simulation(&args).await.is_err());
    }
}
