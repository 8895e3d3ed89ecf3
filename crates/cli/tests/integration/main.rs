mod build_tests;
mod common;
mod lock_tests;
mod path_tests;
