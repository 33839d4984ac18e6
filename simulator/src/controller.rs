//! Simulation controller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use futures::future::join_all;
use futures::{stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use balanced_common::{AccountId, Amount, LedgerError};
use balanced_ledger::{AccountType, LedgerEngine, LedgerStore, Posting};

use crate::metrics::SimulationMetrics;
use crate::scenario::{Expect, Scenario, ScenarioStep};

/// Makes the next `n` commits fail in the underlying store.
pub type FaultInjector = Box<dyn Fn(u32) + Send + Sync>;

/// Attempts per posting when the failure is retryable.
const MAX_ATTEMPTS: u32 = 3;

/// A randomly generated operation.
#[derive(Debug, Clone, Copy)]
enum RandomOp {
    Deposit(AccountId, Amount),
    Withdraw(AccountId, Amount),
    Transfer(AccountId, AccountId, Amount),
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Controls the simulation.
pub struct SimulationController<S: LedgerStore> {
    engine: Arc<LedgerEngine<S>>,
    /// Accounts by scenario label.
    accounts: HashMap<String, AccountId>,
    metrics: SimulationMetrics,
    fault_injector: Option<FaultInjector>,
    rng: StdRng,
}

impl<S: LedgerStore> SimulationController<S> {
    /// Create a new simulation controller.
    pub fn new(engine: Arc<LedgerEngine<S>>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            engine,
            accounts: HashMap::new(),
            metrics: SimulationMetrics::new(),
            fault_injector: None,
            rng,
        }
    }

    /// Enable `FailNextCommits` steps.
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    /// Get simulation metrics.
    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }

    /// Run a scenario, failing on the first unmet expectation.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!(
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Running scenario: {}",
            scenario.description
        );

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .map_err(|err| err.context(format!("step {index} ({step:?})")))?;
        }

        Ok(())
    }

    /// Create accounts, fund them, then fire random postings with bounded
    /// concurrency.
    pub async fn run_random(
        &mut self,
        account_count: usize,
        operations: usize,
        concurrency: usize,
    ) -> anyhow::Result<()> {
        if account_count < 2 {
            bail!("random load needs at least 2 accounts");
        }

        info!(account_count, operations, concurrency, "Running random load");

        let mut ids = Vec::with_capacity(account_count);
        for i in 0..account_count {
            let label = format!("ACCT_{i:03}");
            let id = self.open_account(&label, i % 2 == 1).await?;
            let opening = Amount::from_major(self.rng.gen_range(100..1_000))?;
            let result = self.engine.deposit(id, opening).await;
            self.metrics.record(&result, 0);
            result?;
            ids.push(id);
        }

        let ops: Vec<RandomOp> = (0..operations).map(|_| self.random_op(&ids)).collect();

        let engine = self.engine.clone();
        let outcomes: Vec<_> = stream::iter(ops)
            .map(|op| {
                let engine = engine.clone();
                async move {
                    let started = Instant::now();
                    let result = match op {
                        RandomOp::Deposit(account, amount) => engine.deposit(account, amount).await,
                        RandomOp::Withdraw(account, amount) => {
                            engine.withdraw(account, amount).await
                        }
                        RandomOp::Transfer(from, to, amount) => {
                            engine.transfer(from, to, amount).await
                        }
                    };
                    (result, elapsed_us(started))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (result, latency) in &outcomes {
            self.metrics.record(result, *latency);
        }

        Ok(())
    }

    fn random_op(&mut self, ids: &[AccountId]) -> RandomOp {
        let amount = Amount::from_minor(self.rng.gen_range(1..50_000));
        let from = ids[self.rng.gen_range(0..ids.len())];
        match self.rng.gen_range(0..10) {
            0 | 1 => RandomOp::Deposit(from, amount),
            2 | 3 => RandomOp::Withdraw(from, amount),
            _ => {
                let mut to = ids[self.rng.gen_range(0..ids.len())];
                while to == from {
                    to = ids[self.rng.gen_range(0..ids.len())];
                }
                RandomOp::Transfer(from, to, amount)
            }
        }
    }

    async fn open_account(&mut self, label: &str, savings: bool) -> anyhow::Result<AccountId> {
        let account_type = if savings {
            AccountType::Savings
        } else {
            AccountType::Checking
        };
        let account = self.engine.create_account(label, account_type).await?;
        self.accounts.insert(label.to_string(), account.id);
        info!(label, account = %account.id, "Opened account");
        Ok(account.id)
    }

    fn account(&self, label: &str) -> anyhow::Result<AccountId> {
        self.accounts
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("unknown account label {label}"))
    }

    /// Run one posting, retrying retryable failures with the suggested delay.
    async fn with_retry<F, Fut>(&mut self, mut post: F) -> Result<Posting, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Posting, LedgerError>>,
    {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = post().await;
            self.metrics.record(&result, elapsed_us(started));

            match result {
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = err.retry_after_ms().unwrap_or(100);
                    warn!(attempt, delay_ms = delay, error = %err, "Retrying posting");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::OpenAccount { label, savings } => {
                self.open_account(label, *savings).await?;
            }
            ScenarioStep::Deposit { account, amount } => {
                let id = self.account(account)?;
                let amount = Amount::parse(amount)?;
                let engine = self.engine.clone();
                self.with_retry(move || {
                    let engine = engine.clone();
                    async move { engine.deposit(id, amount).await }
                })
                .await?;
            }
            ScenarioStep::Withdraw {
                account,
                amount,
                expect,
            } => {
                let id = self.account(account)?;
                let amount = Amount::parse(amount)?;
                let engine = self.engine.clone();
                let result = self.with_retry(move || {
                    let engine = engine.clone();
                    async move { engine.withdraw(id, amount).await }
                })
                .await;
                check_expectation(*expect, &result)?;
            }
            ScenarioStep::Transfer {
                from,
                to,
                amount,
                expect,
            } => {
                let (from, to) = (self.account(from)?, self.account(to)?);
                let amount = Amount::parse(amount)?;
                let engine = self.engine.clone();
                let result = self.with_retry(move || {
                    let engine = engine.clone();
                    async move { engine.transfer(from, to, amount).await }
                })
                .await;
                check_expectation(*expect, &result)?;
            }
            ScenarioStep::Race {
                from,
                to,
                amount,
                count,
            } => {
                let (from, to) = (self.account(from)?, self.account(to)?);
                let amount = Amount::parse(amount)?;
                let tasks: Vec<_> = (0..*count)
                    .map(|_| self.spawn_transfer(from, to, amount))
                    .collect();
                let results = self.collect(tasks).await?;

                let committed = results.iter().filter(|r| r.is_ok()).count();
                let rejected = results
                    .iter()
                    .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
                    .count();
                info!(committed, rejected, "Race finished");
                if committed + rejected != *count {
                    bail!("race produced unexpected failures: {results:?}");
                }
            }
            ScenarioStep::Crossfire {
                a,
                b,
                amount,
                count,
            } => {
                let (a, b) = (self.account(a)?, self.account(b)?);
                let amount = Amount::parse(amount)?;
                let tasks: Vec<_> = (0..*count)
                    .map(|i| {
                        if i % 2 == 0 {
                            self.spawn_transfer(a, b, amount)
                        } else {
                            self.spawn_transfer(b, a, amount)
                        }
                    })
                    .collect();
                let results = self.collect(tasks).await?;
                if let Some(Err(err)) = results.iter().find(|r| r.is_err()) {
                    bail!("crossfire transfer failed: {err}");
                }
                info!(transfers = count, "Crossfire finished");
            }
            ScenarioStep::FailNextCommits { count } => match &self.fault_injector {
                Some(inject) => {
                    info!(count, "Injecting commit failures");
                    inject(*count);
                }
                None => warn!("Store does not support fault injection, step skipped"),
            },
            ScenarioStep::AssertBalance { account, amount } => {
                let id = self.account(account)?;
                let expected = Amount::parse(amount)?;
                let actual = self.engine.get_balance(id).await?.balance;
                if actual != expected {
                    bail!("balance of {account} is {actual}, expected {expected}");
                }
            }
        }

        Ok(())
    }

    fn spawn_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> tokio::task::JoinHandle<(Result<Posting, LedgerError>, u64)> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = engine.transfer(from, to, amount).await;
            (result, elapsed_us(started))
        })
    }

    async fn collect<I>(&mut self, tasks: I) -> anyhow::Result<Vec<Result<Posting, LedgerError>>>
    where
        I: IntoIterator<Item = tokio::task::JoinHandle<(Result<Posting, LedgerError>, u64)>>,
    {
        let mut results = Vec::new();
        for joined in join_all(tasks).await {
            let (result, latency) = joined?;
            self.metrics.record(&result, latency);
            results.push(result);
        }
        Ok(results)
    }
}

fn check_expectation(expect: Expect, result: &Result<Posting, LedgerError>) -> anyhow::Result<()> {
    match (expect, result) {
        (Expect::Committed, Ok(_)) => Ok(()),
        (Expect::InsufficientFunds, Err(LedgerError::InsufficientFunds { .. })) => Ok(()),
        (expect, Ok(posting)) => bail!("expected {expect:?}, transaction {} committed", posting.id()),
        (expect, Err(err)) => bail!("expected {expect:?}, got error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balanced_ledger::{InMemoryStore, LedgerConfig};

    fn controller() -> (SimulationController<InMemoryStore>, Arc<LedgerEngine<InMemoryStore>>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(LedgerEngine::new(store.clone(), &LedgerConfig::default()));
        let controller = SimulationController::new(engine.clone(), Some(7))
            .with_fault_injector(Box::new(move |n| store.fail_next_commits(n)));
        (controller, engine)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_builtin_scenarios_pass() {
        for name in Scenario::NAMES {
            let (mut controller, engine) = controller();
            controller
                .run_scenario(Scenario::load(name).unwrap())
                .await
                .unwrap();
            assert!(engine.check_integrity().await.unwrap().passed, "{name}");
        }
    }

    #[tokio::test]
    async fn test_failure_recovery_records_the_fault() {
        let (mut controller, _engine) = controller();
        controller
            .run_scenario(Scenario::load("failure-recovery").unwrap())
            .await
            .unwrap();
        assert_eq!(controller.metrics().failures_with("STORAGE_ERROR"), 1);
    }

    #[tokio::test]
    async fn test_unmet_expectation_fails_scenario() {
        let (mut controller, _engine) = controller();
        let scenario = Scenario {
            name: "broken".to_string(),
            description: "overdraft expected to commit".to_string(),
            steps: vec![
                ScenarioStep::OpenAccount {
                    label: "A".to_string(),
                    savings: false,
                },
                ScenarioStep::Withdraw {
                    account: "A".to_string(),
                    amount: "1.00".to_string(),
                    expect: Expect::Committed,
                },
            ],
        };
        assert!(controller.run_scenario(scenario).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_load_keeps_ledger_consistent() {
        let (mut controller, engine) = controller();
        controller.run_random(6, 300, 8).await.unwrap();

        let report = engine.check_integrity().await.unwrap();
        assert!(report.passed, "{:?}", report.violations);
        assert_eq!(controller.metrics().total_operations, 306);
        assert_eq!(controller.metrics().failures_with("LOCK_TIMEOUT"), 0);
    }
}
