//! Public Grok model catalog. Each entry binds the public id to the
//! upstream `(modelName, modelMode)` pair, the id used for rate-limit
//! polling, a relative cost multiplier, and whether it needs a super-tier
//! token.

pub const NORMAL_RATE_LIMIT_MODEL: &str = "grok-3";
pub const HEAVY_RATE_LIMIT_MODEL: &str = "grok-4-heavy";
pub const HEAVY_MODEL_ID: &str = "grok-4-heavy";
pub const IMAGINE_MODEL_ID: &str = "grok-imagine-0.9";

#[derive(Debug, Clone, Copy)]
pub struct GrokModel {
    pub id: &'static str,
    pub grok_model: &'static str,
    pub model_mode: &'static str,
    pub rate_limit_model: &'static str,
    pub cost: u32,
    pub requires_super: bool,
    /// Image/video generation model; takes the media payload path.
    pub media: bool,
}

pub static MODEL_TABLE: [GrokModel; 8] = [
    GrokModel {
        id: "grok-3",
        grok_model: "grok-3",
        model_mode: "MODEL_MODE_AUTO",
        rate_limit_model: "grok-3",
        cost: 1,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-3-fast",
        grok_model: "grok-3",
        model_mode: "MODEL_MODE_FAST",
        rate_limit_model: "grok-3",
        cost: 1,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-4",
        grok_model: "grok-4",
        model_mode: "MODEL_MODE_AUTO",
        rate_limit_model: "grok-4",
        cost: 2,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-4-fast",
        grok_model: "grok-4-mini-thinking-tahoe",
        model_mode: "MODEL_MODE_FAST",
        rate_limit_model: "grok-4-mini-thinking-tahoe",
        cost: 1,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-4-reasoning",
        grok_model: "grok-4",
        model_mode: "MODEL_MODE_REASONING",
        rate_limit_model: "grok-4",
        cost: 2,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-4-expert",
        grok_model: "grok-4",
        model_mode: "MODEL_MODE_EXPERT",
        rate_limit_model: "grok-4",
        cost: 4,
        requires_super: false,
        media: false,
    },
    GrokModel {
        id: "grok-4-heavy",
        grok_model: "grok-4-heavy",
        model_mode: "MODEL_MODE_HEAVY",
        rate_limit_model: "grok-4-heavy",
        cost: 8,
        requires_super: true,
        media: false,
    },
    GrokModel {
        id: "grok-imagine-0.9",
        grok_model: "grok-3",
        model_mode: "MODEL_MODE_AUTO",
        rate_limit_model: "grok-3",
        cost: 2,
        requires_super: false,
        media: true,
    },
];

pub fn find(model_id: &str) -> Option<&'static GrokModel> {
    MODEL_TABLE.iter().find(|m| m.id == model_id)
}

pub fn is_heavy(model_id: &str) -> bool {
    model_id == HEAVY_MODEL_ID
}

pub fn model_ids() -> Vec<String> {
    MODEL_TABLE.iter().map(|m| m.id.to_string()).collect()
}
