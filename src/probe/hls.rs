//! HLS playlist check.

use super::Prober;
use crate::config::HttpMethod;
use crate::model::{CheckResult, ErrType, ResultTree};

use m3u8_rs::Playlist;

/// Outcome of parsing a fetched playlist.
enum Parsed {
    Variants(Vec<String>),
    Media,
}

fn parse(body: &[u8]) -> Result<Parsed, ErrType> {
    match m3u8_rs::parse_playlist_res(body) {
        Ok(Playlist::MasterPlaylist(pl)) if pl.variants.is_empty() => Err(ErrType::ListEmpty),
        Ok(Playlist::MasterPlaylist(pl)) => Ok(Parsed::Variants(pl.variants.into_iter().map(|v| v.uri).collect())),
        Ok(Playlist::MediaPlaylist(pl)) if pl.segments.is_empty() => Err(ErrType::ListEmpty),
        Ok(Playlist::MediaPlaylist(_)) => Ok(Parsed::Media),
        Err(_) => Err(ErrType::BadFormat),
    }
}

impl Prober {
    /// Fetch a playlist and, for a master playlist, every variant playlist.
    ///
    /// Playlists are always fetched with GET whatever the group method is.
    /// Variants become children of the master in the returned tree.
    pub async fn exec_hls(&self, uri: &str) -> ResultTree {
        let master = self.fetch(uri, HttpMethod::Get, true).await;
        if master.err_type != ErrType::Success {
            return ResultTree::new(master);
        }

        let parsed = parse(&master.body);
        let mut tree = ResultTree::new(master);
        let variants = match parsed {
            Ok(Parsed::Variants(variants)) => variants,
            Ok(Parsed::Media) => return tree,
            Err(err) => {
                tree.root_mut().err_type = err;
                return tree;
            }
        };

        let Ok(base) = reqwest::Url::parse(uri) else {
            tree.root_mut().err_type = ErrType::HlsParser;
            return tree;
        };

        for variant in variants {
            let child = match base.join(&variant) {
                Ok(url) => self.exec_variant(url.as_str()).await,
                Err(e) => {
                    tracing::debug!("Probe: bad variant {:?} in {}: {}", variant, uri, e);
                    tree.root_mut().err_type = ErrType::HlsParser;
                    continue;
                }
            };
            tree.push_child(ResultTree::ROOT, child);
        }
        tree
    }

    async fn exec_variant(&self, uri: &str) -> CheckResult {
        let mut result = self.fetch(uri, HttpMethod::Get, true).await;
        if result.err_type == ErrType::Success {
            if let Err(err) = parse(&result.body) {
                result.err_type = err;
            }
        }
        result
    }
}
