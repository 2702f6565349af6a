mod helpers;
mod repair_tests;
mod session_tests;
