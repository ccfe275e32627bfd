//! Concrete workflows shipped with the runner.

pub mod tcgcsv;
