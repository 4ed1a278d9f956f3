//! Probability-left blocks of the biased task.

use rand::Rng;
use serde::Serialize;

use crate::config::BlockCfg;
use crate::error::{Result, RigError};
use crate::sampling::{TruncExp, uniform_choice};

/// One block as it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlockRecord {
    pub block_num: usize,
    pub block_length: usize,
    pub probability_left: f64,
}

/// Round to one decimal, the granularity of block probabilities.
fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct BlockSchedule {
    cfg: BlockCfg,
    blocks: Vec<BlockRecord>,
    block_trial_num: usize,
}

impl BlockSchedule {
    /// Fails unless every block this config can open has at least one trial
    /// and a probability in `[0, 1]`.
    pub fn new(cfg: BlockCfg) -> Result<Self> {
        let l = &cfg.length;
        TruncExp::new(l.scale, l.min, l.max)?;
        if !(l.min >= 1.0) {
            return Err(RigError::Config(format!(
                "block length minimum must be >= 1 trial, got {}",
                l.min
            ))
            .into());
        }
        if cfg.init_5050 && cfg.init_5050_len == 0 {
            return Err(
                RigError::Config("balanced first block needs at least 1 trial".into()).into(),
            );
        }
        if cfg.probability_set.is_empty() {
            return Err(RigError::Config("blocks.probability_set is empty".into()).into());
        }
        if let Some(p) = cfg
            .probability_set
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(RigError::Config(format!(
                "block probabilities must lie in [0, 1], got {p}"
            ))
            .into());
        }
        Ok(Self {
            cfg,
            blocks: Vec::new(),
            block_trial_num: 0,
        })
    }

    /// Count one trial into the current block, opening a new block first when
    /// none exists yet or the current one is used up.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<BlockRecord> {
        let block = match self.blocks.last() {
            Some(b) if self.block_trial_num < b.block_length => *b,
            _ => {
                let b = self.new_block(rng)?;
                self.blocks.push(b);
                self.block_trial_num = 0;
                b
            }
        };
        self.block_trial_num += 1;
        Ok(block)
    }

    fn new_block<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BlockRecord> {
        let block_num = self.blocks.len();
        let balanced = self.cfg.init_5050;
        let block_length = if balanced && block_num == 0 {
            self.cfg.init_5050_len
        } else {
            self.cfg.length.sample(rng)? as usize
        };
        let probability_left = match (block_num, self.blocks.last()) {
            (0, _) if balanced => 0.5,
            (0, _) => uniform_choice(rng, &self.cfg.probability_set)?,
            (1, _) if balanced => uniform_choice(rng, &self.cfg.probability_set)?,
            (_, Some(prev)) => round1((1.0 - prev.probability_left).abs()),
            (_, None) => uniform_choice(rng, &self.cfg.probability_set)?,
        };
        tracing::debug!(block_num, block_length, probability_left, "new block");
        Ok(BlockRecord {
            block_num,
            block_length,
            probability_left,
        })
    }

    pub fn current(&self) -> Option<&BlockRecord> {
        self.blocks.last()
    }

    /// 1-based position of the latest trial inside the current block.
    pub fn block_trial_num(&self) -> usize {
        self.block_trial_num
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }
}
