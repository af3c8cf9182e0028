//! 交互层。目前只有命令行（noui）一种。

pub mod noui;
