/// Result alias for test signatures, so tests can use `?` freely.
pub type ResultTest<T> = anyhow::Result<T>;
