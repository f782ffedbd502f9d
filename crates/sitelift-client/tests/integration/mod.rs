mod common;
mod extraction_tests;
mod realtime_tests;
