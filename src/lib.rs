pub mod pikeyd;
