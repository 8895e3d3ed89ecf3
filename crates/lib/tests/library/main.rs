mod common;
mod eval_cache_tests;
mod installables_tests;
