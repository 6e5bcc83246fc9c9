//! Built-in agent specialists

pub mod chat;
pub mod divination;
pub mod i18n;
pub mod master;

pub use chat::ChatSpecialist;
pub use divination::DivinationSpecialist;
pub use i18n::I18nSpecialist;
pub use master::MasterSpecialist;
