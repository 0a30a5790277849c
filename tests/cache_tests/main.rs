//! Cache test suite

mod lru_tests;
