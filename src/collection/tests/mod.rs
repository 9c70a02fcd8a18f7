pub mod helpers;
mod tests_validate;
