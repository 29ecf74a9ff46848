pub mod check;
pub mod config;
pub mod proxy;
pub mod score;
pub mod subscription;
pub mod ui;

#[cfg(test)]
mod test_support;
