pub(crate) mod lstsq;
