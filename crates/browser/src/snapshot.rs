//! Readings of the answer region.

use chatrelay_core::{Result, Selectors};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::driver::PageDriver;
use crate::scripts;

/// Text of the last answer region plus how many answer regions exist.
///
/// `count` lets a reader ignore the previous answer that is still on screen
/// between submitting and the new region appearing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub count: u64,
    pub text: String,
}

impl Snapshot {
    pub fn new(count: u64, text: &str) -> Self {
        Self {
            count,
            text: text.to_string(),
        }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// The text if this reading belongs to an answer newer than `baseline`.
    pub fn text_after(&self, baseline: u64) -> &str {
        if self.count > baseline {
            &self.text
        } else {
            ""
        }
    }
}

/// Read the last answer region with reply chrome left out, so streamed
/// text matches what extraction returns.
pub async fn read_answer(page: &dyn PageDriver, selectors: &Selectors) -> Result<Snapshot> {
    let value = page
        .evaluate(
            scripts::ANSWER_SNAPSHOT,
            vec![json!(selectors.answer_region), json!(selectors.reply_chrome)],
        )
        .await?;
    Ok(serde_json::from_value(value)?)
}
