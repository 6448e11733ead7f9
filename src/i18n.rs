/// Localized CLI text. Selected with `--locale` (e.g. `--locale zh`).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "zh_cn" | "zh-hans" | "zh-tw" | "zh_tw" => Self::Zh,
            _ => Self::En,
        }
    }
}

pub struct Messages {
    pub analyzing: &'static str,
    pub found: &'static str,
    pub nothing_found: &'static str,
    pub analysis_failed: &'static str,
    pub already_downloaded: &'static str,
    pub nothing_selected: &'static str,
    pub merge_tool_missing: &'static str,
    pub batch_started: &'static str,
    pub controls_hint: &'static str,
    pub paused: &'static str,
    pub resumed: &'static str,
    pub cancelling: &'static str,
    pub pool_restarted: &'static str,
    pub retrying: &'static str,
    pub merging: &'static str,
    pub status_done: &'static str,
    pub status_failed: &'static str,
    pub status_cancelled: &'static str,
    pub summary_header: &'static str,
    pub history_empty: &'static str,
    pub command_rejected: &'static str,
}

pub static EN: Messages = Messages {
    analyzing: "Analyzing",
    found: "Found",
    nothing_found: "No downloadable resources found",
    analysis_failed: "Analysis failed",
    already_downloaded: "already downloaded",
    nothing_selected: "Nothing to download for the selected kinds",
    merge_tool_missing: "ffmpeg not found; skipping playlists (install it or pass --ffmpeg)",
    batch_started: "Downloading",
    controls_hint: "keys: p=pause r=resume c=cancel R=restart pool (then Enter)",
    paused: "paused",
    resumed: "resumed",
    cancelling: "cancelling",
    pool_restarted: "pool restarted, generation",
    retrying: "retrying",
    merging: "merging",
    status_done: "done",
    status_failed: "failed",
    status_cancelled: "cancelled",
    summary_header: "Summary",
    history_empty: "No resources recorded yet",
    command_rejected: "command rejected",
};

pub static ZH: Messages = Messages {
    analyzing: "正在分析",
    found: "发现",
    nothing_found: "未发现可下载的资源",
    analysis_failed: "分析失败",
    already_downloaded: "已下载",
    nothing_selected: "所选类型没有可下载的资源",
    merge_tool_missing: "未找到 ffmpeg，跳过播放列表（请安装或使用 --ffmpeg 指定）",
    batch_started: "开始下载",
    controls_hint: "按键: p=暂停 r=继续 c=取消 R=重启线程池（回车确认）",
    paused: "已暂停",
    resumed: "已继续",
    cancelling: "正在取消",
    pool_restarted: "线程池已重启，代号",
    retrying: "重试中",
    merging: "合并中",
    status_done: "完成",
    status_failed: "失败",
    status_cancelled: "已取消",
    summary_header: "摘要",
    history_empty: "暂无记录",
    command_rejected: "命令被拒绝",
};

pub fn get_messages(locale: Locale) -> &'static Messages {
    match locale {
        Locale::En => &EN,
        Locale::Zh => &ZH,
    }
}
