mod consume;
mod helper;
mod lifecycle;
