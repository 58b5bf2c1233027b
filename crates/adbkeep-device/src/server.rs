use std::fmt;

use serde::Serialize;

/// Game server region implied by the installed package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Cn,
    En,
    Jp,
    Tw,
}

/// Official package per server, plus distribution-channel variants.
const PACKAGES: &[(&str, Server)] = &[
    ("com.bilibili.azurlane", Server::Cn),
    ("com.YoStarEN.AzurLane", Server::En),
    ("com.YoStarJP.AzurLane", Server::Jp),
    ("com.hkmanjuu.azurlane.gp", Server::Tw),
    ("com.bilibili.blhx.huawei", Server::Cn),
    ("com.bilibili.blhx.mi", Server::Cn),
    ("com.tencent.tmgp.bilibili.blhx", Server::Cn),
    ("com.bilibili.blhx.baidu", Server::Cn),
    ("com.bilibili.blhx.qihoo", Server::Cn),
    ("com.bilibili.blhx.nearme.gamecenter", Server::Cn),
    ("com.bilibili.blhx.vivo", Server::Cn),
    ("com.bilibili.blhx.mz", Server::Cn),
    ("com.bilibili.blhx.dl", Server::Cn),
    ("com.bilibili.blhx.lenovo", Server::Cn),
    ("com.bilibili.blhx.uc", Server::Cn),
    ("com.bilibili.blhx.mzw", Server::Cn),
    ("com.yiwu.blhx.yx15", Server::Cn),
    ("com.bilibili.blhx.m4399", Server::Cn),
    ("com.bilibili.blhx.bilibiliMove", Server::Cn),
    ("com.hkmanjuu.azurlane.gp.mc", Server::Tw),
];

impl Server {
    pub const ALL: [Server; 4] = [Server::Cn, Server::En, Server::Jp, Server::Tw];

    pub fn from_package(package: &str) -> Option<Self> {
        PACKAGES
            .iter()
            .find(|(name, _)| *name == package)
            .map(|(_, server)| *server)
    }

    pub fn official_package(self) -> &'static str {
        match self {
            Server::Cn => "com.bilibili.azurlane",
            Server::En => "com.YoStarEN.AzurLane",
            Server::Jp => "com.YoStarJP.AzurLane",
            Server::Tw => "com.hkmanjuu.azurlane.gp",
        }
    }

    /// Language of the server's client.
    pub fn lang(self) -> &'static str {
        match self {
            Server::Cn => "zh-CN",
            Server::En => "en-US",
            Server::Jp => "ja-JP",
            Server::Tw => "zh-TW",
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Server::Cn => "cn",
            Server::En => "en",
            Server::Jp => "jp",
            Server::Tw => "tw",
        };
        f.write_str(text)
    }
}
