//! MySQL/MariaDB source driver.
//!
//! Provides [`MysqlReader`], the `SourceReader` over an SQLx MySQL pool.
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod reader;

pub use reader::{chunk_query, MysqlReader};
