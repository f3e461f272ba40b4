use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PromptTemplate {
    pub id: &'static str,
    pub description: &'static str,
    pub text: &'static str,
}

pub const DEFAULT_PROMPT_ID: &str = "podrobny";

const DETAILED_PROMPT: &str = "\
Pozorně si prohlédni přiloženou fotografii jídla.

Postupuj v těchto krocích:
1. Vyjmenuj všechny ingredience, které na fotografii rozpoznáš.
2. Odvoď pravděpodobný způsob přípravy (vaření, pečení, smažení, grilování, syrové apod.).
3. Odhadni velikost porce v gramech.
4. Na základě ingrediencí, přípravy a porce odhadni nutriční hodnoty.

Odpověz česky přesně v tomto formátu:

Název jídla:
[výstižný český název jídla]

Kalorická hodnota:
[odhad v kcal pro zobrazenou porci včetně stručného zdůvodnění]

Nutriční hodnoty:
[bílkoviny, sacharidy, tuky a vláknina v gramech]

Zdravotní přínosy:
[hlavní přínosy tohoto jídla]

Zdravotní rizika:
[možná rizika, alergeny a na co si dát pozor]";

const BASIC_PROMPT: &str = "\
Pozorně si prohlédni přiloženou fotografii jídla. Zaměř se na ingredience, \
způsob přípravy, velikost porce a celkový vzhled.

1. Navrhni výstižný a popisný název tohoto jídla v češtině.
2. Odhadni přibližnou kalorickou hodnotu zobrazeného jídla s ohledem na \
viditelné ingredience, velikost porce a předpokládaný způsob přípravy.

Odpověz v tomto formátu:

<odpoved>
<nazev_jidla>
[navržený název jídla v češtině]
</nazev_jidla>

<kaloricka_hodnota>
[odhad kalorické hodnoty v češtině včetně zdůvodnění]
</kaloricka_hodnota>
</odpoved>";

pub const PROMPT_CATALOG: &[PromptTemplate] = &[
    PromptTemplate {
        id: DEFAULT_PROMPT_ID,
        description: "ingredients, preparation, portion, nutrition, benefits and risks",
        text: DETAILED_PROMPT,
    },
    PromptTemplate {
        id: "zakladni",
        description: "dish name and calorie estimate only",
        text: BASIC_PROMPT,
    },
];

pub fn find_prompt(id: &str) -> Option<&'static PromptTemplate> {
    let needle = id.trim();
    PROMPT_CATALOG
        .iter()
        .find(|template| template.id.eq_ignore_ascii_case(needle))
}

pub fn default_prompt() -> &'static PromptTemplate {
    &PROMPT_CATALOG[0]
}
