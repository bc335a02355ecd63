pub mod fetch;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod record;
pub mod services;
pub mod subscribe;
pub mod vehicles;
