use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res};
use url::Url;

use super::ProxyError;

/// Rewrites HLS playlists so that every URI points back at the local proxy.
///
/// Variant and rendition playlists go to `{base}/playlist`, segments, keys and
/// init maps to `{base}/segment`. Relative URIs are resolved against the
/// playlist's own URL first.
#[derive(Debug, Clone)]
pub struct PlaylistRewriter {
    base_path: String,
}

impl PlaylistRewriter {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn playlist_route(&self, target: &str, referer: Option<&str>) -> String {
        self.local_route("playlist", target, referer)
    }

    pub fn segment_route(&self, target: &str, referer: Option<&str>) -> String {
        self.local_route("segment", target, referer)
    }

    fn local_route(&self, kind: &str, target: &str, referer: Option<&str>) -> String {
        let mut route = format!(
            "{}/{kind}?url={}",
            self.base_path,
            urlencoding::encode(target)
        );
        if let Some(referer) = referer {
            route.push_str("&referer=");
            route.push_str(&urlencoding::encode(referer));
        }
        route
    }

    pub fn rewrite(
        &self,
        content: &[u8],
        playlist_url: &Url,
        referer: Option<&str>,
    ) -> Result<String, ProxyError> {
        let playlist = match parse_playlist_res(content) {
            Ok(Playlist::MasterPlaylist(master)) => {
                Playlist::MasterPlaylist(self.rewrite_master(master, playlist_url, referer)?)
            }
            Ok(Playlist::MediaPlaylist(media)) => {
                Playlist::MediaPlaylist(self.rewrite_media(media, playlist_url, referer)?)
            }
            Err(e) => return Err(ProxyError::PlaylistParse(e.to_string())),
        };

        let mut out = Vec::with_capacity(content.len() * 2);
        playlist
            .write_to(&mut out)
            .map_err(|e| ProxyError::PlaylistParse(e.to_string()))?;
        String::from_utf8(out).map_err(|e| ProxyError::PlaylistParse(e.to_string()))
    }

    fn rewrite_master(
        &self,
        mut master: MasterPlaylist,
        base: &Url,
        referer: Option<&str>,
    ) -> Result<MasterPlaylist, ProxyError> {
        for variant in &mut master.variants {
            let target = absolutize(base, &variant.uri)?;
            variant.uri = self.playlist_route(&target, referer);
        }
        for alternative in &mut master.alternatives {
            if let Some(uri) = alternative.uri.as_deref() {
                let target = absolutize(base, uri)?;
                alternative.uri = Some(self.playlist_route(&target, referer));
            }
        }
        Ok(master)
    }

    fn rewrite_media(
        &self,
        mut media: MediaPlaylist,
        base: &Url,
        referer: Option<&str>,
    ) -> Result<MediaPlaylist, ProxyError> {
        for segment in &mut media.segments {
            if !segment.uri.trim().is_empty() {
                let target = absolutize(base, &segment.uri)?;
                segment.uri = self.segment_route(&target, referer);
            }
            if let Some(key) = segment.key.as_mut()
                && let Some(uri) = key.uri.as_deref()
            {
                let target = absolutize(base, uri)?;
                key.uri = Some(self.segment_route(&target, referer));
            }
            if let Some(map) = segment.map.as_mut() {
                let target = absolutize(base, &map.uri)?;
                map.uri = self.segment_route(&target, referer);
            }
        }
        Ok(media)
    }
}

impl Default for PlaylistRewriter {
    fn default() -> Self {
        Self::new("/proxy")
    }
}

fn absolutize(base: &Url, uri: &str) -> Result<String, ProxyError> {
    base.join(uri.trim())
        .map(|u| u.to_string())
        .map_err(|e| ProxyError::InvalidUrl(format!("{uri}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,AUDIO=\"aud\"
720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,AUDIO=\"aud\"
https://other.example.net/1080/index.m3u8
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/k1.bin\"
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
seg1.ts
#EXT-X-ENDLIST
";

    fn encoded(url: &str) -> String {
        urlencoding::encode(url).into_owned()
    }

    #[test]
    fn test_rewrites_master_variants_and_renditions() {
        let rewriter = PlaylistRewriter::default();
        let base = Url::parse("https://cdn.example.com/movie/master.m3u8").unwrap();

        let out = rewriter
            .rewrite(MASTER.as_bytes(), &base, Some("https://embed.example.com/"))
            .unwrap();

        assert!(out.contains(&format!(
            "/proxy/playlist?url={}&referer={}",
            encoded("https://cdn.example.com/movie/720/index.m3u8"),
            encoded("https://embed.example.com/")
        )));
        assert!(out.contains(&encoded("https://other.example.net/1080/index.m3u8")));
        assert!(out.contains(&encoded("https://cdn.example.com/movie/audio/en.m3u8")));
        assert!(!out.contains("\n720/index.m3u8"));
    }

    #[test]
    fn test_rewrites_segments_keys_and_maps() {
        let rewriter = PlaylistRewriter::default();
        let base = Url::parse("https://cdn.example.com/movie/720/index.m3u8").unwrap();

        let out = rewriter.rewrite(MEDIA.as_bytes(), &base, None).unwrap();

        assert!(out.contains(&format!(
            "/proxy/segment?url={}",
            encoded("https://cdn.example.com/movie/720/seg0.ts")
        )));
        assert!(out.contains(&encoded("https://cdn.example.com/movie/720/seg1.ts")));
        assert!(out.contains(&encoded("https://cdn.example.com/keys/k1.bin")));
        assert!(out.contains(&encoded("https://cdn.example.com/movie/720/init.mp4")));
        assert!(!out.contains("referer="));
        assert!(out.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_rejects_non_playlists() {
        let rewriter = PlaylistRewriter::default();
        let base = Url::parse("https://cdn.example.com/x.m3u8").unwrap();
        assert!(matches!(
            rewriter.rewrite(b"<html>nope</html>", &base, None),
            Err(ProxyError::PlaylistParse(_))
        ));
    }
}
