pub mod enums;
pub mod site;
pub mod medication;
pub mod person;
pub mod dispensing;

pub use enums::*;
pub use site::*;
pub use medication::*;
pub use person::*;
pub use dispensing::*;
