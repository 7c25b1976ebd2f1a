//! Cross-module tests for the guard


mod policy_test;
