//! different utility modules used throughout the project
/// iteration history of the solver, can be saved into csv file
pub mod history;
/// logger configuration: console and/or file
pub mod logging;
/// parse document with structure like " title1 key1: value1, value2 key2: value2 title2 key3:value3, value4" into HashMap
pub mod task_parser;
