#[cfg(test)]
mod call_factory;
#[cfg(test)]
mod connectivity_watch;
