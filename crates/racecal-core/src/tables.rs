//! Static grade, stage, course and priority tables per race type.

use crate::RaceType;

/// A course (venue) and the code used inside composite ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourseRecord {
    pub name: &'static str,
    pub code: &'static str,
}

/// Publishing priority of a grade, or of a (grade, stage) pair for mechanical racing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradeStagePriority {
    pub grade: &'static str,
    pub stage: Option<&'static str>,
    pub priority: i32,
}

/// Raw label variants seen on source pages for one canonical stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLabel {
    pub stage: &'static str,
    pub website_labels: &'static [&'static str],
}

#[derive(Debug)]
pub struct ClassificationTable {
    pub race_type: RaceType,
    pub grades: &'static [&'static str],
    pub stages: &'static [StageLabel],
    pub courses: &'static [CourseRecord],
    pub surfaces: &'static [&'static str],
    pub priorities: &'static [GradeStagePriority],
}

impl ClassificationTable {
    pub fn has_grade(&self, grade: &str) -> bool {
        self.grades.contains(&grade)
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }

    pub fn course(&self, name: &str) -> Option<&'static CourseRecord> {
        self.courses.iter().find(|c| c.name == name)
    }

    pub fn has_surface(&self, surface: &str) -> bool {
        self.surfaces.contains(&surface)
    }

    /// Canonical stage for a raw scraped label. Exact canonical names match too.
    pub fn stage_from_website_label(&self, label: &str) -> Option<&'static str> {
        let label = label.trim();
        self.stages
            .iter()
            .find(|s| s.stage == label || s.website_labels.contains(&label))
            .map(|s| s.stage)
    }

    /// Grades that carry a priority record; the default publishing list.
    pub fn display_grades(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for p in self.priorities {
            if !out.contains(&p.grade) {
                out.push(p.grade);
            }
        }
        out
    }

    /// Priority of a (grade, stage) pair, restricted to `display_grades`. 0 when unmatched.
    pub fn priority(&self, grade: &str, stage: Option<&str>, display_grades: &[&str]) -> i32 {
        if !display_grades.contains(&grade) {
            return 0;
        }
        self.priorities
            .iter()
            .find(|p| p.grade == grade && p.stage == stage)
            .map(|p| p.priority)
            .unwrap_or(0)
    }
}

pub fn table(race_type: RaceType) -> &'static ClassificationTable {
    match race_type {
        RaceType::Jra => &JRA,
        RaceType::Nar => &NAR,
        RaceType::Overseas => &OVERSEAS,
        RaceType::Keirin => &KEIRIN,
        RaceType::Autorace => &AUTORACE,
        RaceType::Boatrace => &BOATRACE,
    }
}

const fn grade(grade: &'static str, priority: i32) -> GradeStagePriority {
    GradeStagePriority {
        grade,
        stage: None,
        priority,
    }
}

const fn staged(grade: &'static str, stage: &'static str, priority: i32) -> GradeStagePriority {
    GradeStagePriority {
        grade,
        stage: Some(stage),
        priority,
    }
}

const fn course(name: &'static str, code: &'static str) -> CourseRecord {
    CourseRecord { name, code }
}

const fn label(stage: &'static str, website_labels: &'static [&'static str]) -> StageLabel {
    StageLabel {
        stage,
        website_labels,
    }
}

// Horse racing

static JRA: ClassificationTable = ClassificationTable {
    race_type: RaceType::Jra,
    grades: &[
        "GⅠ",
        "GⅡ",
        "GⅢ",
        "J.GⅠ",
        "J.GⅡ",
        "J.GⅢ",
        "Listed",
        "オープン特別",
        "オープン",
        "3勝クラス",
        "2勝クラス",
        "1勝クラス",
        "未勝利",
        "新馬",
        "格付けなし",
    ],
    stages: &[],
    courses: &[
        course("札幌", "01"),
        course("函館", "02"),
        course("福島", "03"),
        course("新潟", "04"),
        course("東京", "05"),
        course("中山", "06"),
        course("中京", "07"),
        course("京都", "08"),
        course("阪神", "09"),
        course("小倉", "10"),
    ],
    surfaces: &["芝", "ダート", "障害"],
    priorities: &[
        grade("GⅠ", 9),
        grade("J.GⅠ", 8),
        grade("GⅡ", 7),
        grade("J.GⅡ", 6),
        grade("GⅢ", 6),
        grade("J.GⅢ", 5),
        grade("Listed", 4),
        grade("オープン特別", 3),
    ],
};

static NAR: ClassificationTable = ClassificationTable {
    race_type: RaceType::Nar,
    grades: &[
        "GⅠ",
        "GⅡ",
        "GⅢ",
        "JpnⅠ",
        "JpnⅡ",
        "JpnⅢ",
        "重賞",
        "地方重賞",
        "地方準重賞",
        "Listed",
        "オープン特別",
        "一般",
        "格付けなし",
    ],
    stages: &[],
    courses: &[
        course("門別", "30"),
        course("盛岡", "35"),
        course("水沢", "36"),
        course("浦和", "42"),
        course("船橋", "43"),
        course("大井", "44"),
        course("川崎", "45"),
        course("金沢", "46"),
        course("笠松", "47"),
        course("名古屋", "48"),
        course("園田", "50"),
        course("姫路", "51"),
        course("高知", "54"),
        course("佐賀", "55"),
        course("帯広ば", "65"),
    ],
    surfaces: &["芝", "ダート"],
    priorities: &[
        grade("GⅠ", 9),
        grade("JpnⅠ", 8),
        grade("GⅡ", 7),
        grade("JpnⅡ", 6),
        grade("GⅢ", 6),
        grade("JpnⅢ", 5),
        grade("重賞", 4),
        grade("地方重賞", 3),
        grade("地方準重賞", 2),
        grade("Listed", 2),
        grade("オープン特別", 1),
    ],
};

static OVERSEAS: ClassificationTable = ClassificationTable {
    race_type: RaceType::Overseas,
    grades: &["GⅠ", "GⅡ", "GⅢ", "Listed", "格付けなし"],
    stages: &[],
    courses: &[
        course("パリロンシャン", "PAR"),
        course("シャンティイ", "CHA"),
        course("ドーヴィル", "DEA"),
        course("サンクルー", "SCL"),
        course("アスコット", "ASC"),
        course("エプソム", "EPS"),
        course("ニューマーケット", "NEW"),
        course("グッドウッド", "GOO"),
        course("ヨーク", "YOR"),
        course("カラ", "CUR"),
        course("レパーズタウン", "LEO"),
        course("メイダン", "MEY"),
        course("キングアブドゥルアジーズ", "KAA"),
        course("シャティン", "SHA"),
        course("ハッピーバレー", "HAP"),
        course("フレミントン", "FLE"),
        course("コーフィールド", "CAU"),
        course("ムーニーバレー", "MOO"),
        course("ランドウィック", "RAN"),
        course("チャーチルダウンズ", "CHU"),
        course("サンタアニタパーク", "SAN"),
        course("ベルモントパーク", "BEL"),
        course("サラトガ", "SAR"),
    ],
    surfaces: &["芝", "ダート", "オールウェザー"],
    priorities: &[
        grade("GⅠ", 9),
        grade("GⅡ", 7),
        grade("GⅢ", 6),
        grade("Listed", 3),
    ],
};

// Mechanical racing

static KEIRIN: ClassificationTable = ClassificationTable {
    race_type: RaceType::Keirin,
    grades: &["GP", "GⅠ", "GⅡ", "GⅢ", "FⅠ", "FⅡ"],
    stages: &[
        label("S級グランプリ", &["Ｓ級グランプリ", "S級 グランプリ", "KEIRINグランプリ"]),
        label(
            "L級ガールズグランプリ",
            &["Ｌ級ガールズグランプリ", "ガールズグランプリ", "L級 ガールズグランプリ"],
        ),
        label("S級決勝", &["Ｓ級決勝", "S級 決勝", "Ｓ級 決勝", "S級決勝戦"]),
        label("S級準決勝", &["Ｓ級準決勝", "S級 準決勝", "Ｓ級 準決勝"]),
        label("S級特別優秀", &["Ｓ級特別優秀", "S級 特別優秀", "Ｓ級 特別優秀"]),
        label("S級優秀", &["Ｓ級優秀", "S級 優秀", "Ｓ級 優秀"]),
        label(
            "S級ゴールデンレーサー賞",
            &["Ｓ級ゴールデンレーサー賞", "S級 ゴールデンレーサー賞"],
        ),
        label(
            "S級ダイヤモンドレース",
            &["Ｓ級ダイヤモンドレース", "S級 ダイヤモンドレース"],
        ),
        label("S級特選", &["Ｓ級特選", "S級 特選", "Ｓ級 特選"]),
        label("S級選抜", &["Ｓ級選抜", "S級 選抜", "Ｓ級 選抜"]),
        label("S級二次予選", &["Ｓ級二次予選", "S級 二次予選", "Ｓ級 二次予選", "S級二予"]),
        label("S級一次予選", &["Ｓ級一次予選", "S級 一次予選", "Ｓ級 一次予選", "S級一予"]),
        label("S級予選", &["Ｓ級予選", "S級 予選", "Ｓ級 予選"]),
        label("L級ガールズ決勝", &["Ｌ級ガールズ決勝", "L級 ガールズ決勝", "Ｌ級 ガ決勝"]),
        label("L級ガールズ準決勝", &["Ｌ級ガールズ準決勝", "L級 ガールズ準決勝"]),
        label("L級ガールズ予選", &["Ｌ級ガールズ予選", "L級 ガールズ予選", "Ｌ級 ガ予選"]),
        label("A級決勝", &["Ａ級決勝", "A級 決勝", "Ａ級 決勝"]),
        label("A級準決勝", &["Ａ級準決勝", "A級 準決勝", "Ａ級 準決勝"]),
        label("A級予選", &["Ａ級予選", "A級 予選", "Ａ級 予選"]),
    ],
    courses: &[
        course("函館", "11"),
        course("青森", "12"),
        course("いわき平", "13"),
        course("弥彦", "21"),
        course("前橋", "22"),
        course("取手", "23"),
        course("宇都宮", "24"),
        course("大宮", "25"),
        course("西武園", "26"),
        course("京王閣", "27"),
        course("立川", "28"),
        course("松戸", "31"),
        course("千葉", "32"),
        course("川崎", "34"),
        course("平塚", "35"),
        course("小田原", "36"),
        course("伊東", "37"),
        course("静岡", "38"),
        course("名古屋", "42"),
        course("岐阜", "43"),
        course("大垣", "44"),
        course("豊橋", "45"),
        course("富山", "46"),
        course("松阪", "47"),
        course("四日市", "48"),
        course("福井", "51"),
        course("奈良", "53"),
        course("向日町", "54"),
        course("和歌山", "55"),
        course("岸和田", "56"),
        course("玉野", "61"),
        course("広島", "62"),
        course("防府", "63"),
        course("高松", "71"),
        course("小松島", "73"),
        course("高知", "74"),
        course("松山", "75"),
        course("小倉", "81"),
        course("久留米", "83"),
        course("武雄", "84"),
        course("佐世保", "85"),
        course("別府", "86"),
        course("熊本", "87"),
    ],
    surfaces: &[],
    priorities: &[
        staged("GP", "S級グランプリ", 9),
        staged("GP", "L級ガールズグランプリ", 8),
        staged("GⅠ", "S級決勝", 9),
        staged("GⅠ", "S級準決勝", 7),
        staged("GⅠ", "S級特別優秀", 6),
        staged("GⅠ", "S級優秀", 6),
        staged("GⅠ", "S級ゴールデンレーサー賞", 6),
        staged("GⅠ", "S級ダイヤモンドレース", 6),
        staged("GⅠ", "S級特選", 5),
        staged("GⅠ", "S級選抜", 4),
        staged("GⅠ", "S級二次予選", 4),
        staged("GⅠ", "S級一次予選", 3),
        staged("GⅠ", "L級ガールズ決勝", 6),
        staged("GⅠ", "L級ガールズ予選", 4),
        staged("GⅡ", "S級決勝", 8),
        staged("GⅡ", "S級準決勝", 5),
        staged("GⅡ", "S級優秀", 5),
        staged("GⅡ", "S級特選", 4),
        staged("GⅡ", "S級選抜", 3),
        staged("GⅡ", "S級二次予選", 3),
        staged("GⅡ", "S級一次予選", 2),
        staged("GⅢ", "S級決勝", 6),
        staged("GⅢ", "S級準決勝", 3),
        staged("GⅢ", "S級特選", 2),
        staged("GⅢ", "S級二次予選", 1),
        staged("GⅢ", "S級一次予選", 1),
        staged("GⅢ", "S級予選", 1),
        staged("GⅢ", "L級ガールズ決勝", 3),
        staged("FⅠ", "S級決勝", 4),
        staged("FⅠ", "S級準決勝", 2),
        staged("FⅠ", "S級特選", 1),
        staged("FⅠ", "L級ガールズ決勝", 3),
        staged("FⅠ", "A級決勝", 1),
        staged("FⅡ", "S級決勝", 2),
        staged("FⅡ", "L級ガールズ決勝", 2),
        staged("FⅡ", "A級決勝", 1),
    ],
};

static AUTORACE: ClassificationTable = ClassificationTable {
    race_type: RaceType::Autorace,
    grades: &["SG", "特GⅠ", "GⅠ", "GⅡ", "開催"],
    stages: &[
        label("優勝戦", &["優勝", "優 勝 戦"]),
        label("準決勝戦", &["準決勝", "準決", "準 決 勝 戦"]),
        label("準々決勝戦", &["準々決勝", "準々決"]),
        label("特別選抜戦", &["特別選抜", "特選"]),
        label("選抜予選", &["選抜予", "選抜 予選"]),
        label("最終予選", &["最終予", "最終 予選"]),
        label("予選", &["予 選"]),
        label("選抜戦", &["選抜"]),
        label("特別一般戦", &["特別一般", "特一般"]),
        label("一般戦", &["一般"]),
    ],
    courses: &[
        course("川口", "02"),
        course("伊勢崎", "03"),
        course("浜松", "04"),
        course("飯塚", "05"),
        course("山陽", "06"),
    ],
    surfaces: &[],
    priorities: &[
        staged("SG", "優勝戦", 9),
        staged("SG", "準決勝戦", 7),
        staged("SG", "準々決勝戦", 5),
        staged("SG", "特別選抜戦", 5),
        staged("SG", "選抜予選", 4),
        staged("SG", "最終予選", 4),
        staged("SG", "予選", 4),
        staged("特GⅠ", "優勝戦", 8),
        staged("特GⅠ", "準決勝戦", 5),
        staged("特GⅠ", "特別選抜戦", 4),
        staged("特GⅠ", "予選", 3),
        staged("GⅠ", "優勝戦", 7),
        staged("GⅠ", "準決勝戦", 4),
        staged("GⅠ", "特別選抜戦", 3),
        staged("GⅠ", "予選", 2),
        staged("GⅡ", "優勝戦", 6),
        staged("GⅡ", "準決勝戦", 3),
        staged("GⅡ", "予選", 1),
        staged("開催", "優勝戦", 3),
        staged("開催", "準決勝戦", 1),
    ],
};

static BOATRACE: ClassificationTable = ClassificationTable {
    race_type: RaceType::Boatrace,
    grades: &["SG", "GⅠ", "GⅡ", "GⅢ", "一般"],
    stages: &[
        label("優勝戦", &["優勝", "優 勝 戦"]),
        label("準優勝戦", &["準優勝", "準優"]),
        label("準優進出戦", &["準優進出", "準進"]),
        label("ドリーム戦", &["ドリーム", "ﾄﾞﾘｰﾑ"]),
        label("予選特賞", &["特賞", "予選 特賞"]),
        label("予選", &["予 選"]),
        label("選抜戦", &["選抜"]),
        label("一般戦", &["一般"]),
    ],
    courses: &[
        course("桐生", "01"),
        course("戸田", "02"),
        course("江戸川", "03"),
        course("平和島", "04"),
        course("多摩川", "05"),
        course("浜名湖", "06"),
        course("蒲郡", "07"),
        course("常滑", "08"),
        course("津", "09"),
        course("三国", "10"),
        course("びわこ", "11"),
        course("住之江", "12"),
        course("尼崎", "13"),
        course("鳴門", "14"),
        course("丸亀", "15"),
        course("児島", "16"),
        course("宮島", "17"),
        course("徳山", "18"),
        course("下関", "19"),
        course("若松", "20"),
        course("芦屋", "21"),
        course("福岡", "22"),
        course("唐津", "23"),
        course("大村", "24"),
    ],
    surfaces: &[],
    priorities: &[
        staged("SG", "優勝戦", 9),
        staged("SG", "準優勝戦", 7),
        staged("SG", "ドリーム戦", 6),
        staged("SG", "予選特賞", 5),
        staged("SG", "準優進出戦", 5),
        staged("SG", "予選", 4),
        staged("GⅠ", "優勝戦", 7),
        staged("GⅠ", "準優勝戦", 5),
        staged("GⅠ", "ドリーム戦", 4),
        staged("GⅠ", "予選", 2),
        staged("GⅡ", "優勝戦", 6),
        staged("GⅡ", "準優勝戦", 3),
        staged("GⅡ", "予選", 1),
        staged("GⅢ", "優勝戦", 4),
        staged("GⅢ", "準優勝戦", 1),
        staged("一般", "優勝戦", 2),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_priority_record_uses_known_grade_and_stage() {
        for race_type in RaceType::ALL {
            let t = table(race_type);
            assert_eq!(t.race_type, race_type);
            for p in t.priorities {
                assert!(t.has_grade(p.grade), "{race_type}: {} not a grade", p.grade);
                match p.stage {
                    Some(stage) => assert!(t.has_stage(stage), "{race_type}: {stage} not a stage"),
                    None => assert!(race_type.is_horse_racing()),
                }
            }
        }
    }

    #[test]
    fn course_codes_are_unique_per_race_type() {
        for race_type in RaceType::ALL {
            let t = table(race_type);
            let mut codes: Vec<_> = t.courses.iter().map(|c| c.code).collect();
            codes.sort_unstable();
            codes.dedup();
            assert_eq!(codes.len(), t.courses.len(), "{race_type}");
        }
    }

    #[test]
    fn website_labels_resolve_to_canonical_stage() {
        let keirin = table(RaceType::Keirin);
        assert_eq!(keirin.stage_from_website_label("Ｓ級決勝"), Some("S級決勝"));
        assert_eq!(keirin.stage_from_website_label(" S級 二次予選 "), Some("S級二次予選"));
        assert_eq!(keirin.stage_from_website_label("S級決勝"), Some("S級決勝"));
        assert_eq!(keirin.stage_from_website_label("決勝"), None);

        let boat = table(RaceType::Boatrace);
        assert_eq!(boat.stage_from_website_label("準優"), Some("準優勝戦"));
    }

    #[test]
    fn priority_is_zero_outside_display_grades() {
        let keirin = table(RaceType::Keirin);
        assert_eq!(keirin.priority("GⅠ", Some("S級決勝"), &["GⅠ"]), 9);
        assert_eq!(keirin.priority("GⅠ", Some("S級決勝"), &["GⅡ"]), 0);
        assert_eq!(keirin.priority("FⅠ", Some("S級予選"), &["FⅠ"]), 0);

        let jra = table(RaceType::Jra);
        assert_eq!(jra.priority("GⅢ", None, &jra.display_grades()), 6);
        assert_eq!(jra.priority("未勝利", None, &jra.display_grades()), 0);
    }
}
