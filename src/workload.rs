//! Synthetic transfer workloads for exercising the batch executors.

use address_monitor::{Account, Address, WorldState};
use alloy_primitives::U256;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

/// A balance transfer between two external accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    /// Nonce the sender must have when the transfer runs.
    pub nonce: u64,
}

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of accounts in the system.
    pub num_accounts: usize,
    /// Number of transactions to generate.
    pub num_transactions: usize,
    /// Conflict factor: 0.0 = no conflicts, 1.0 = all transactions touch same accounts.
    pub conflict_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Starting balance of every account.
    pub initial_balance: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            initial_balance: 1_000_000,
        }
    }
}

/// A batch of transfers over a fixed set of accounts.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Address>,
    pub transactions: Vec<Transfer>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    ///
    /// With a conflict factor above zero, that share of the transfers is
    /// drawn from a "hot" prefix of the accounts that shrinks as the factor
    /// grows, down to two accounts at 1.0.
    pub fn generate(config: WorkloadConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let num_accounts = config.num_accounts.max(2);

        let accounts: Vec<Address> = (0..num_accounts as u64).map(Address::external).collect();

        // Nonces a sequential run would see, so every generated nonce is valid.
        let mut nonces: HashMap<usize, u64> = HashMap::new();

        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (num_accounts as f64 - 2.0)).max(2.0) as usize
        } else {
            num_accounts
        };

        let transactions: Vec<Transfer> = (0..config.num_transactions)
            .map(|_| {
                let use_hot = rng.gen::<f64>() < config.conflict_factor;
                let pool = if use_hot { hot_account_count } else { num_accounts };

                let from = rng.gen_range(0..pool);
                let mut to = rng.gen_range(0..pool);
                while to == from {
                    to = rng.gen_range(0..pool);
                }

                let nonce = nonces.entry(from).or_insert(0);
                let tx = Transfer {
                    from: accounts[from],
                    to: accounts[to],
                    value: U256::from(rng.gen_range(1..=100u64)),
                    nonce: *nonce,
                };
                *nonce += 1;
                tx
            })
            .collect();

        Self {
            accounts,
            transactions,
            config,
        }
    }

    /// Creates a world state with every account funded.
    pub fn create_state(&self) -> WorldState {
        let balance = U256::from(self.config.initial_balance);
        WorldState::with_accounts(
            self.accounts
                .iter()
                .map(|address| (*address, Account::with_balance(balance))),
        )
    }
}
