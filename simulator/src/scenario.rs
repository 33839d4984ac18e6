//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// Expected outcome of a posting step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expect {
    /// The posting commits, possibly after retries of retryable failures.
    Committed,
    /// The posting is rejected for insufficient funds.
    InsufficientFunds,
}

/// A step in a scenario. Accounts are referred to by label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Open an account.
    OpenAccount { label: String, savings: bool },
    /// Deposit external funds.
    Deposit { account: String, amount: String },
    /// Withdraw funds.
    Withdraw {
        account: String,
        amount: String,
        expect: Expect,
    },
    /// Transfer between two accounts.
    Transfer {
        from: String,
        to: String,
        amount: String,
        expect: Expect,
    },
    /// Launch `count` simultaneous transfers of `amount`.
    Race {
        from: String,
        to: String,
        amount: String,
        count: usize,
    },
    /// Launch `count` transfers alternating direction between two accounts.
    Crossfire {
        a: String,
        b: String,
        amount: String,
        count: usize,
    },
    /// Make the next commits fail in the store, when the store supports it.
    FailNextCommits { count: u32 },
    /// Assert an account's derived balance.
    AssertBalance { account: String, amount: String },
}

fn transfer(from: &str, to: &str, amount: &str, expect: Expect) -> ScenarioStep {
    ScenarioStep::Transfer {
        from: from.to_string(),
        to: to.to_string(),
        amount: amount.to_string(),
        expect,
    }
}

fn open(label: &str) -> ScenarioStep {
    ScenarioStep::OpenAccount {
        label: label.to_string(),
        savings: false,
    }
}

fn deposit(account: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Deposit {
        account: account.to_string(),
        amount: amount.to_string(),
    }
}

fn assert_balance(account: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::AssertBalance {
        account: account.to_string(),
        amount: amount.to_string(),
    }
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 4] = ["walkthrough", "race", "crossfire", "failure-recovery"];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "walkthrough" => Ok(Self::walkthrough()),
            "race" => Ok(Self::race()),
            "crossfire" => Ok(Self::crossfire()),
            "failure-recovery" => Ok(Self::failure_recovery()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Deposit, transfer, rejected overdraft.
    fn walkthrough() -> Self {
        Self {
            name: "walkthrough".to_string(),
            description: "Deposit 100 into X, move 40 to Y, overdraft attempt".to_string(),
            steps: vec![
                open("X"),
                ScenarioStep::OpenAccount {
                    label: "Y".to_string(),
                    savings: true,
                },
                deposit("X", "100.00"),
                transfer("X", "Y", "40.00", Expect::Committed),
                assert_balance("X", "60.00"),
                assert_balance("Y", "40.00"),
                transfer("X", "Y", "100.00", Expect::InsufficientFunds),
                assert_balance("X", "60.00"),
                assert_balance("Y", "40.00"),
                ScenarioStep::Withdraw {
                    account: "Y".to_string(),
                    amount: "15.50".to_string(),
                    expect: Expect::Committed,
                },
                assert_balance("Y", "24.50"),
            ],
        }
    }

    /// Many simultaneous spends against a balance that covers all but one.
    fn race() -> Self {
        Self {
            name: "race".to_string(),
            description: "20 concurrent transfers of 25 from a balance of 475".to_string(),
            steps: vec![
                open("SOURCE"),
                open("SINK"),
                deposit("SOURCE", "475.00"),
                ScenarioStep::Race {
                    from: "SOURCE".to_string(),
                    to: "SINK".to_string(),
                    amount: "25.00".to_string(),
                    count: 20,
                },
                assert_balance("SOURCE", "0.00"),
                assert_balance("SINK", "475.00"),
            ],
        }
    }

    /// Opposite-direction transfers over one pair of accounts.
    fn crossfire() -> Self {
        Self {
            name: "crossfire".to_string(),
            description: "200 alternating transfers between A and B".to_string(),
            steps: vec![
                open("A"),
                open("B"),
                deposit("A", "1000.00"),
                deposit("B", "1000.00"),
                ScenarioStep::Crossfire {
                    a: "A".to_string(),
                    b: "B".to_string(),
                    amount: "1.00".to_string(),
                    count: 200,
                },
                assert_balance("A", "1000.00"),
                assert_balance("B", "1000.00"),
            ],
        }
    }

    /// A commit failure leaves no trace and a retry succeeds.
    fn failure_recovery() -> Self {
        Self {
            name: "failure-recovery".to_string(),
            description: "Storage fault during a transfer, then retry".to_string(),
            steps: vec![
                open("A"),
                open("B"),
                deposit("A", "50.00"),
                ScenarioStep::FailNextCommits { count: 1 },
                // Committed on the retry.
                transfer("A", "B", "20.00", Expect::Committed),
                assert_balance("A", "30.00"),
                assert_balance("B", "20.00"),
            ],
        }
    }
}
