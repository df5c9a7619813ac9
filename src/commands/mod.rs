pub mod apply;
pub mod inspect;
pub mod settings;
