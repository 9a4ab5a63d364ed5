/// BitForge chain parameters
/// All consensus-critical constants are defined here.

/// Base unit denomination (satoshis per coin)
pub const COIN: u64 = 100_000_000;

/// Maximum amount any output or sum of outputs may carry
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Initial block reward: 50 coins
pub const INITIAL_BLOCK_REWARD: u64 = 50 * COIN;

/// Subsidy halves every 210,000 blocks
pub const HALVING_INTERVAL: u32 = 210_000;

/// Blocks before coinbase outputs may be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum signature operations per block
pub const MAX_SIG_OPS: u32 = 20_000;

/// How far into the future a block timestamp may be (seconds)
pub const BLOCK_ALLOWED_TIME_DRIFT: u64 = 2 * 60 * 60;

/// Number of previous blocks whose median time a new block must exceed
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Blocks between difficulty retargets
pub const RETARGET_INTERVAL: u32 = 2016;

/// Intended time for one retarget interval (two weeks)
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Maximum live branches tracked by the validator
pub const MAX_BRANCH_CACHE: usize = 5;

/// Maximum blocks held waiting for their parent
pub const MAX_ORPHAN_CACHE: usize = 20;

/// Maximum blocks waiting in the processing queue
pub const MAX_BLOCK_QUEUE: usize = MAX_ORPHAN_CACHE;

/// Lock times below this are block heights, above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Coinbase input script length bounds
pub const MIN_COINBASE_SCRIPT: usize = 2;
pub const MAX_COINBASE_SCRIPT: usize = 100;

/// Calculate block reward at a given height
pub fn block_reward(height: u32) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

use crate::core::types::*;

/// Script of the genesis coinbase, including the Times headline
const GENESIS_SCRIPT_SIG: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";

const GENESIS_OUTPUT_SCRIPT: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

/// Network-specific consensus settings
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub name: &'static str,
    /// Message start bytes, also framing `blk*.dat` files
    pub magic: [u8; 4],
    /// Highest (easiest) compact target allowed
    pub max_target: u32,
    pub genesis_time: u32,
    pub genesis_nonce: u32,
    pub genesis_target: u32,
    /// Blocks whose duplicate coinbase hashes predate BIP30 enforcement
    pub bip30_exceptions: Vec<Hash256>,
    /// Block time from which P2SH redeem scripts are evaluated
    pub p2sh_activation_time: u32,
    /// Keep the target fixed at every retarget boundary
    pub no_retargeting: bool,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        NetworkParams {
            name: "main",
            magic: [0xF9, 0xBE, 0xB4, 0xD9],
            max_target: 0x1d00ffff,
            genesis_time: 1231006505,
            genesis_nonce: 2083236893,
            genesis_target: 0x1d00ffff,
            bip30_exceptions: vec![
                // Heights 91842 and 91880
                [
                    0xec, 0xca, 0xe0, 0x00, 0xe3, 0xc8, 0xe4, 0xe0, 0x93, 0x93, 0x63, 0x60, 0x43, 0x1f, 0x3b, 0x76,
                    0x03, 0xc5, 0x63, 0xc1, 0xff, 0x61, 0x81, 0x39, 0x0a, 0x4d, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00,
                ],
                [
                    0x21, 0xd7, 0x7c, 0xcb, 0x4c, 0x08, 0x38, 0x6a, 0x04, 0xac, 0x01, 0x96, 0xae, 0x10, 0xf6, 0xa1,
                    0xd2, 0xc2, 0xa3, 0x77, 0x55, 0x8c, 0xa1, 0x90, 0xf1, 0x43, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00,
                ],
            ],
            p2sh_activation_time: 1333238400,
            no_retargeting: false,
        }
    }

    /// Regression-test network: trivially easy proof of work, same genesis
    /// transaction, no BIP30 exceptions.
    pub fn regtest() -> Self {
        NetworkParams {
            name: "regtest",
            magic: [0xFA, 0xBF, 0xB5, 0xDA],
            max_target: 0x207fffff,
            genesis_time: 1296688602,
            genesis_nonce: 2,
            genesis_target: 0x207fffff,
            bip30_exceptions: Vec::new(),
            p2sh_activation_time: 0,
            no_retargeting: true,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "main" | "mainnet" => Some(Self::mainnet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }

    pub fn is_bip30_exception(&self, block_hash: &Hash256) -> bool {
        self.bip30_exceptions.iter().any(|h| h == block_hash)
    }

    /// Build the genesis block for this network
    pub fn genesis_block(&self) -> Block {
        let script_sig = hex::decode(GENESIS_SCRIPT_SIG).unwrap_or_default();
        let script_pubkey = hex::decode(GENESIS_OUTPUT_SCRIPT).unwrap_or_default();
        let coinbase = Transaction::new_coinbase(
            script_sig,
            vec![TxOutput { value: INITIAL_BLOCK_REWARD, script_pubkey }],
        );
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: NULL_HASH,
                merkle_root: NULL_HASH,
                time: self.genesis_time,
                target: self.genesis_target,
                nonce: self.genesis_nonce,
            },
            vec![coinbase],
        );
        block.update_merkle_root();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reward() {
        assert_eq!(block_reward(0), 50 * COIN);
    }

    #[test]
    fn test_first_halving() {
        assert_eq!(block_reward(HALVING_INTERVAL - 1), 50 * COIN);
        assert_eq!(block_reward(HALVING_INTERVAL), 25 * COIN);
    }

    #[test]
    fn test_eventual_zero_reward() {
        assert_eq!(block_reward(HALVING_INTERVAL * 33), 0);
        assert_eq!(block_reward(u32::MAX), 0);
    }

    #[test]
    fn test_total_supply_below_max_money() {
        let mut total: u64 = 0;
        let mut height: u32 = 0;
        while block_reward(height) > 0 {
            total += block_reward(height) * HALVING_INTERVAL as u64;
            height += HALVING_INTERVAL;
        }
        assert!(total <= MAX_MONEY);
        assert!(total > MAX_MONEY - COIN);
    }

    #[test]
    fn test_mainnet_genesis_hash() {
        let genesis = NetworkParams::mainnet().genesis_block();
        assert_eq!(
            hash_to_hex(&genesis.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            hash_to_hex(&genesis.header().merkle_root),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }

    #[test]
    fn test_regtest_genesis_hash() {
        let genesis = NetworkParams::regtest().genesis_block();
        assert_eq!(
            hash_to_hex(&genesis.hash()),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_bip30_exceptions_only_on_mainnet() {
        let main = NetworkParams::mainnet();
        let first = main.bip30_exceptions[0];
        assert!(main.is_bip30_exception(&first));
        assert!(!NetworkParams::regtest().is_bip30_exception(&first));
    }
}
