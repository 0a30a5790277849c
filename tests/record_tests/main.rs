//! Record test suite
