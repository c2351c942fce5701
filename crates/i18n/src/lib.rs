use std::collections::BTreeMap;

use core_types::UiLanguage;

#[derive(Debug, Clone)]
pub struct I18n {
    lang: UiLanguage,
    zh_cn: BTreeMap<&'static str, &'static str>,
    en_us: BTreeMap<&'static str, &'static str>,
}

impl I18n {
    pub fn new(lang: UiLanguage) -> Self {
        Self {
            lang,
            zh_cn: zh_cn_map(),
            en_us: en_us_map(),
        }
    }

    pub fn set_language(&mut self, lang: UiLanguage) {
        self.lang = lang;
    }

    pub fn language(&self) -> UiLanguage {
        self.lang
    }

    pub fn t<'a>(&'a self, key: &'a str) -> &'a str {
        let (primary, fallback) = match self.lang {
            UiLanguage::ZhCn => (&self.zh_cn, &self.en_us),
            UiLanguage::EnUs => (&self.en_us, &self.zh_cn),
        };
        primary
            .get(key)
            .or_else(|| fallback.get(key))
            .copied()
            .unwrap_or(key)
    }

    /// Translation followed by `detail` when there is one.
    pub fn with_detail(&self, key: &str, detail: &str) -> String {
        let text = self.t(key);
        if detail.is_empty() {
            text.to_string()
        } else {
            format!("{text}: {detail}")
        }
    }
}

fn zh_cn_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("app.title", "快记"),
        ("notify.note_created", "已创建新笔记"),
        ("notify.note_deleted", "笔记已删除"),
        ("notify.tag_added", "已添加标签"),
        ("notify.tag_removed", "已移除标签"),
        ("notify.create_failed", "创建笔记失败"),
        ("notify.update_failed", "保存笔记失败"),
        ("notify.delete_failed", "删除笔记失败"),
        ("notify.tag_failed", "更新标签失败"),
        ("notify.search_failed", "搜索失败"),
        ("notify.sync_failed", "获取笔记失败"),
        ("shell.welcome", "快记已就绪，输入 help 查看命令"),
        ("shell.signed_in_as", "已登录"),
        ("shell.signed_out", "已退出登录"),
        ("shell.sign_in_required", "请先登录"),
        ("shell.no_active_note", "没有打开的笔记"),
        ("shell.no_notes", "暂无笔记"),
        ("shell.loading", "加载中..."),
        ("shell.pinned", "置顶"),
        ("shell.notes", "笔记"),
        ("shell.search_results", "搜索结果"),
        ("shell.categories", "分类"),
        ("shell.tags", "标签"),
        ("shell.theme", "主题"),
        ("shell.plan", "套餐"),
        ("shell.saved", "已保存"),
        ("shell.error", "错误"),
        ("shell.unknown_command", "无法识别的命令"),
        ("shell.help", "命令列表"),
        ("voice.premium_only", "语音输入仅对高级版用户开放"),
    ])
}

fn en_us_map() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("app.title", "QuickNote"),
        ("notify.note_created", "New note created"),
        ("notify.note_deleted", "Note deleted"),
        ("notify.tag_added", "Tag added"),
        ("notify.tag_removed", "Tag removed"),
        ("notify.create_failed", "Failed to create note"),
        ("notify.update_failed", "Failed to save note"),
        ("notify.delete_failed", "Failed to delete note"),
        ("notify.tag_failed", "Failed to update tags"),
        ("notify.search_failed", "Search failed"),
        ("notify.sync_failed", "Failed to fetch notes"),
        ("shell.welcome", "QuickNote ready, type `help` for commands"),
        ("shell.signed_in_as", "Signed in as"),
        ("shell.signed_out", "Signed out"),
        ("shell.sign_in_required", "Sign in first"),
        ("shell.no_active_note", "No note is open"),
        ("shell.no_notes", "No notes yet"),
        ("shell.loading", "Loading..."),
        ("shell.pinned", "Pinned"),
        ("shell.notes", "Notes"),
        ("shell.search_results", "Search results"),
        ("shell.categories", "Categories"),
        ("shell.tags", "Tags"),
        ("shell.theme", "Theme"),
        ("shell.plan", "Plan"),
        ("shell.saved", "Saved"),
        ("shell.error", "Error"),
        ("shell.unknown_command", "Unrecognized command"),
        ("shell.help", "Commands"),
        (
            "voice.premium_only",
            "Voice input is available on the Premium plan",
        ),
    ])
}
