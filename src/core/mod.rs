// Domain services and shared errors/models
pub mod metrics_sync {
    pub use crate::metrics_sync::*;
}

pub mod structure_cache {
    pub use crate::structure_cache::*;
}

pub mod budgets {
    pub use crate::budgets::*;
}

pub mod provisioning {
    pub use crate::provisioning::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
